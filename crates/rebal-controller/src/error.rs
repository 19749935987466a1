//! Controller error types.

use thiserror::Error;

/// Errors that stop the controller during INIT.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Core(#[from] rebal_core::CoreError),

    #[error("initial placement failed: {0}")]
    Placement(#[from] rebal_placement::PlacementError),

    #[error("config error: {0}")]
    Config(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
