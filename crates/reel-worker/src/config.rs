//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity used to claim jobs
    pub worker_id: String,
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Segments synthesized concurrently within one job
    pub segment_parallelism: usize,
    /// Upper bound for one job attempt
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for temporary files
    pub work_dir: PathBuf,
    /// Delay between dequeue attempts when the queue is empty
    pub poll_interval: Duration,
    /// Interval for extending the lease of running jobs
    pub heartbeat_interval: Duration,
    /// How often expired leases are recovered
    pub stall_check_interval: Duration,
    /// Port of the Prometheus scrape endpoint
    pub metrics_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            max_concurrent_jobs: 2,
            segment_parallelism: 1,
            job_timeout: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
            work_dir: std::env::temp_dir().join("reel"),
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(30),
            metrics_port: 9091,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            segment_parallelism: env_parse("WORKER_SEGMENT_PARALLELISM")
                .unwrap_or(defaults.segment_parallelism)
                .max(1),
            job_timeout: Duration::from_secs(env_parse("WORKER_JOB_TIMEOUT").unwrap_or(3600)),
            shutdown_timeout: Duration::from_secs(env_parse("WORKER_SHUTDOWN_TIMEOUT").unwrap_or(30)),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            poll_interval: Duration::from_millis(env_parse("WORKER_POLL_INTERVAL_MS").unwrap_or(1000)),
            heartbeat_interval: Duration::from_secs(env_parse("WORKER_HEARTBEAT_SECS").unwrap_or(30)),
            stall_check_interval: Duration::from_secs(env_parse("WORKER_STALL_CHECK_SECS").unwrap_or(30)),
            metrics_port: env_parse("WORKER_METRICS_PORT").unwrap_or(defaults.metrics_port),
        }
    }
}
