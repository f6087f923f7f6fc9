//! Generation worker.
//!
//! Pulls jobs from the shared queue and drives each task through speech
//! synthesis, talking-head video synthesis and the final merge. Failed tasks
//! are recorded and their credits refunded.

pub mod compensation;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use compensation::{compensate, Compensation};
pub use config::WorkerConfig;
pub use context::{PipelineDeps, PipelineSettings};
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobExecutor, JobOutcome};
pub use logging::TaskLogger;
pub use pipeline::TaskPipeline;
pub use retry::{retry_async, FailureTracker, RetryConfig};
