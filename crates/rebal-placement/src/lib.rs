//! rebal-placement: decides where each worker thread runs.
//!
//! This crate is pure computation: it never talks to machines. The
//! controller feeds it cost weights and the participating machines, and
//! gets back candidate partitions and commit decisions.
//!
//! # Components
//!
//! - **`partition`**: the thread → machine mapping, derived views, distance
//! - **`partitioner`**: longest-processing-time greedy assignment
//! - **`policy`**: hysteresis deciding whether a candidate is worth migrating to
//! - **`error`**: capacity and input errors

pub mod error;
pub mod partition;
pub mod partitioner;
pub mod policy;

pub use error::{PlacementError, PlacementResult};
pub use partition::{Partition, partition_distance, target_shares};
pub use partitioner::Partitioner;
pub use policy::{Decision, Evaluation, RejectReason, RepartitionPolicy};
