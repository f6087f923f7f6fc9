//! Synthesis client error types.

use thiserror::Error;

pub type SynthResult<T> = Result<T, SynthError>;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("Synthesis service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Video job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Video job {job_id} not finished after {waited_secs} seconds")]
    PollTimeout { job_id: String, waited_secs: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SynthError {
    /// Outages, 5xx answers, timeouts and dropped connections.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SynthError::ServiceUnavailable(_)
                | SynthError::PollTimeout { .. }
                | SynthError::Network(_)
                | SynthError::Cancelled
        )
    }

    /// Map a non-success HTTP status to an error. 5xx and 429 are transient.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        let message = format!("{}: {}", status, body);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            SynthError::ServiceUnavailable(message)
        } else {
            SynthError::RequestFailed(message)
        }
    }
}
