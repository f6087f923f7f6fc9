//! Worker error types.
//!
//! Every failure of a job attempt is classified so the executor can decide
//! between retrying with backoff and failing the task for good.

use thiserror::Error;

use reel_media::MediaError;
use reel_models::TaskId;
use reel_queue::QueueError;
use reel_storage::StorageError;
use reel_store::StoreError;
use reel_synth::SynthError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Network errors, 5xx answers, timeouts, poll timeouts, cancellation.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A synthesis service rejected or failed the work.
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Merge failed: {0}")]
    MergeFailed(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// The task record does not allow this job to run.
    #[error("Invalid task state: {0}")]
    InvalidState(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SynthError> for WorkerError {
    fn from(e: SynthError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::SynthesisFailed(e.to_string())
        }
    }
}

/// Every media failure fails the task, timeouts and IO included. A cancelled
/// operation is the exception: the job was interrupted, not the merge.
impl From<MediaError> for WorkerError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Cancelled => Self::Transient(e.to_string()),
            other => Self::MergeFailed(other.to_string()),
        }
    }
}

impl WorkerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn synthesis_failed(msg: impl Into<String>) -> Self {
        Self::SynthesisFailed(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether attempt number `attempt` (1-based) may be retried.
    ///
    /// Synthesis failures get one retry; merge failures and missing tasks none.
    pub fn is_retryable(&self, attempt: u32) -> bool {
        match self {
            Self::Transient(_) | Self::Queue(_) | Self::Io(_) => true,
            Self::SynthesisFailed(_) => attempt <= 1,
            Self::Store(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::MergeFailed(_) | Self::TaskNotFound(_) | Self::InvalidState(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::SynthesisFailed(_) => "synthesis",
            Self::MergeFailed(_) => "merge",
            Self::TaskNotFound(_) => "task_not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Store(_) => "store",
            Self::Storage(_) => "storage",
            Self::Queue(_) => "queue",
            Self::Io(_) => "io",
        }
    }
}
