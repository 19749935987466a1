//! rebal-core: shared types and file formats for the rebal controller.
//!
//! - **`types`**: thread/machine identities and telemetry samples
//! - **`config`**: the TOML cluster config (roster + tuning knobs)
//! - **`estimates`**: the static per-thread work-estimate file
//! - **`error`**: parse and config errors shared by every crate

pub mod config;
pub mod error;
pub mod estimates;
pub mod types;

pub use config::{
    ClusterConfig, ClusterSection, DistributionSettings, MachineEntry, PolicySettings,
    TelemetrySettings,
};
pub use error::{CoreError, CoreResult};
pub use estimates::WorkEstimates;
pub use types::*;
