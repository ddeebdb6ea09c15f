//! Controller error types.

use thiserror::Error;

use crate::driver::DriverError;

/// Errors that abort one reconcile pass. The pass is retried on the next
/// tick; no variant is fatal to the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    State(#[from] shoal_state::StateError),

    #[error("instance driver error: {0}")]
    Driver(#[from] DriverError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
