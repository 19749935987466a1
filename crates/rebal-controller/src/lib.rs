//! rebal-controller: the reconfiguration control loop.
//!
//! Ties telemetry, membership and placement together and pushes committed
//! partitions out to worker sessions. The controller owns every piece of
//! mutable state; the outside world talks to it only through a
//! [`ControllerHandle`] (inbound events) and [`Session`]s (outbound config).
//!
//! # Architecture
//!
//! ```text
//! ReconfigurationController::run()
//!   INIT ── load config + work estimates, build initial partition
//!   AWAITING_START ── until ControllerHandle::start() or set_initial_iteration()
//!   ITERATING (per cycle)
//!   │   COLLECTING_SAMPLES  bounded wait for every participant
//!   │   ESTIMATING          UtilizationTracker → WorkEstimator
//!   │   PARTITIONING        Partitioner::compute_candidate_partition
//!   │   DECIDING            RepartitionPolicy (or forced on membership change)
//!   │   DISTRIBUTING        ConfigDistributor → Session::deliver (spawned)
//!   TERMINATED ── ControllerHandle::shutdown()
//! ```

pub mod controller;
pub mod distributor;
pub mod error;
pub mod session;

pub use controller::{
    ControlEvent, ControllerHandle, ControllerSettings, ControllerState, ControllerStats,
    IterationPhase, ReconfigurationController,
};
pub use distributor::{ConfigDistributor, DeliveryOutcome};
pub use error::{ControllerError, ControllerResult};
pub use session::{ClusterConfigMessage, DeliveryFuture, MachineAddress, Session, SessionConnector};
