//! Domain and repository error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, invariants,
/// malformed identifiers). Infrastructure failures use [`RepositoryError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed notification payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier or enum value could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Error returned by persistence and directory adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The backing store could not be reached (pool closed, timeout, IO).
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness or concurrency constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Any other backend failure.
    #[error("repository error: {0}")]
    Other(String),
}

impl RepositoryError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<DomainError> for RepositoryError {
    fn from(value: DomainError) -> Self {
        Self::Corrupt(value.to_string())
    }
}
