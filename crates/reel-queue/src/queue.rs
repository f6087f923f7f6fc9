//! Job queue contract and configuration.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use reel_models::{Job, Priority, TaskId};

use crate::error::QueueResult;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix for every queue key
    pub prefix: String,
    /// Claims allowed before a job is marked failed
    pub max_attempts: u32,
    /// Lease length of an active job
    pub visibility_timeout: Duration,
    /// First retry delay; doubles per attempt
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
    /// How long finished job records are kept
    pub finished_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "reel".to_string(),
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(600), // 10 minutes
            backoff_base: Duration::from_millis(5_000),
            backoff_max: Duration::from_millis(300_000),
            finished_ttl: Duration::from_secs(86_400),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.prefix),
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            visibility_timeout: env_parse("QUEUE_VISIBILITY_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            backoff_base: env_parse("QUEUE_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: env_parse("QUEUE_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            finished_ttl: env_parse("QUEUE_FINISHED_TTL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.finished_ttl),
        }
    }

    /// Retry delay after the given (1-based) attempt: `base * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_max)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    New(Job),
    /// A live job for the task already existed; nothing was added.
    Existing(Job),
}

impl Enqueued {
    pub fn job(&self) -> &Job {
        match self {
            Self::New(job) | Self::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Result of [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; `attempt` is the attempt that just failed.
    Retrying { attempt: u32, delay: Duration },
    /// Marked failed for good.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    Requeued,
    Dead,
}

/// Active job whose lease expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub job: Job,
    pub outcome: StallOutcome,
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable job queue keyed by task id.
///
/// A job is claimed by one worker at a time under a lease. Ownership of an
/// active job is the pair (`worker_id`, `attempt`) returned by `dequeue`;
/// `heartbeat`, `ack` and `fail` are rejected once that lease is gone.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job for the task unless a waiting/active/delayed one exists.
    async fn enqueue(&self, task_id: TaskId, priority: Priority) -> QueueResult<Enqueued>;

    /// Claim the next job: highest priority first, FIFO within a priority.
    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>>;

    /// Extend the lease. Returns `false` if the job is no longer ours.
    async fn heartbeat(&self, job: &Job) -> QueueResult<bool>;

    /// Mark a claimed job completed.
    async fn ack(&self, job: &Job) -> QueueResult<()>;

    /// Record a failed attempt, rescheduling with backoff when allowed.
    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> QueueResult<FailOutcome>;

    /// Requeue or fail active jobs whose lease expired.
    async fn recover_stalled(&self) -> QueueResult<Vec<StalledJob>>;

    /// Remove a waiting or delayed job. Active jobs are never removed.
    async fn remove(&self, task_id: TaskId) -> QueueResult<bool>;

    async fn get(&self, task_id: TaskId) -> QueueResult<Option<Job>>;

    async fn counts(&self) -> QueueResult<QueueCounts>;

    /// Claims allowed before a failed attempt is final.
    fn max_attempts(&self) -> u32;
}
