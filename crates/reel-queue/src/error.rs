//! Queue error types.

use reel_models::TaskId;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The job is no longer active under this worker/attempt (lease expired and
    /// the job was recovered, or it was already finished).
    #[error("Lease lost for job {0}")]
    LeaseLost(TaskId),

    #[error("Job not found: {0}")]
    JobNotFound(TaskId),

    #[error("Invalid job record: {0}")]
    InvalidRecord(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }
}
