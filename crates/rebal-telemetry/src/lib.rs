//! rebal-telemetry: turns raw CPU samples into partitioner cost weights.
//!
//! # Pipeline
//!
//! ```text
//! UtilizationSample (cpu_util, cpu_idle, address)
//!   → UtilizationTracker::add_sample        normalize to 0.0..=1.0
//!   → compute_per_thread_utilization         split machine load over its threads
//!   → WorkEstimator::compute_work_to_utilization_ratio
//!                                            live figures, static fallback
//!   → ThreadWeights                          consumed by rebal-placement
//! ```
//!
//! Normalization: `util / (util + idle)`, clamped to `0.0..=1.0`. The sum of
//! busy and idle ticks is the machine's own baseline, so a saturated machine
//! reads `1.0` whatever its tick rate.

pub mod estimator;
pub mod tracker;

pub use estimator::WorkEstimator;
pub use tracker::{UtilizationTracker, normalize};
