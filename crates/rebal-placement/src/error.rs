//! Placement error types.

use thiserror::Error;

use rebal_core::{MachineId, ThreadId};

/// Errors that fail a single repartition attempt.
#[derive(Debug, Error, PartialEq)]
pub enum PlacementError {
    #[error("no machines available to host the partition")]
    NoMachines,

    #[error("{shares} target shares given for {machines} machines")]
    ShareMismatch { machines: usize, shares: usize },

    #[error("target shares must be finite, non-negative, and sum to more than zero")]
    InvalidShares,

    #[error("{threads} threads exceed capacity of {capacity} placements")]
    Capacity { threads: usize, capacity: usize },

    #[error("thread {thread} assigned to machine {machine} outside the partition")]
    UnknownMachine { thread: ThreadId, machine: MachineId },
}

pub type PlacementResult<T> = Result<T, PlacementError>;
