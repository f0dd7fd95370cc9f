use classrep_core::{DomainError, RepositoryError};
use classrep_infra::jobs::{HandlerError, QueueError};
use thiserror::Error;

/// Error returned by scheduling and engine operations.
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// The request was rejected before anything was enqueued.
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("engine is not running")]
    NotRunning,
}

impl From<SchedulingError> for HandlerError {
    fn from(e: SchedulingError) -> Self {
        match e {
            SchedulingError::Queue(e) => HandlerError::Queue(e),
            SchedulingError::Repository(e) => HandlerError::Repository(e),
            other => HandlerError::failed(other.to_string()),
        }
    }
}
