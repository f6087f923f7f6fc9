//! Store error types.

use reel_models::{TaskId, TransitionError};
use thiserror::Error;

/// Result type for store and ledger operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    /// Optimistic update lost every retry to concurrent writers.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_) | StoreError::ConnectionFailed(_) | StoreError::Redis(_)
        )
    }
}
