//! Error types.

use quiver_redis::StoreError;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Result type for background job operations.
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Distributed lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock.
    #[error("Lock '{0}' is already held")]
    AlreadyLocked(String),

    /// The caller's token no longer owns the lock.
    #[error("Lock '{0}' not held")]
    NotHeld(String),

    /// Retries were exhausted.
    #[error("Lock timeout")]
    Timeout,

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// Check if the lock is held by someone else.
    pub fn is_already_locked(&self) -> bool {
        matches!(self, Self::AlreadyLocked(_))
    }
}

/// Background job errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found.
    #[error("Background job not found: {0}")]
    NotFound(String),

    /// Another job holds the target.
    #[error("Target '{0}' is locked by another job")]
    TargetLocked(String),

    /// The requested status change is not allowed.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        /// Job id.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The job was canceled while running.
    #[error("Background job canceled: {0}")]
    Cancelled(String),

    /// Concurrent updates kept winning the optimistic retry loop.
    #[error("Concurrent update conflict on job {0}")]
    Conflict(String),

    /// No runner is registered for the job kind.
    #[error("No runner registered for job kind '{0}'")]
    UnknownKind(String),

    /// Runner-specific failure.
    #[error("Job failed: {0}")]
    Failed(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lock error.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

impl JobError {
    /// Check if the error is a contract violation bubbling up from the store.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) | Self::Lock(LockError::Store(e)) => e.is_contract_violation(),
            _ => false,
        }
    }
}
