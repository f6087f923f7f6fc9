//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape endpoint on `0.0.0.0:port`.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const TASKS_COMPLETED_TOTAL: &str = "reel_tasks_completed_total";
    pub const TASKS_FAILED_TOTAL: &str = "reel_tasks_failed_total";
    pub const TASK_RETRIES_TOTAL: &str = "reel_task_retries_total";
    pub const TASK_DURATION_SECONDS: &str = "reel_task_duration_seconds";
    pub const SEGMENTS_SYNTHESIZED_TOTAL: &str = "reel_segments_synthesized_total";
    pub const REFUNDS_TOTAL: &str = "reel_refunds_total";
    pub const REFUNDED_CREDITS_TOTAL: &str = "reel_refunded_credits_total";
    pub const STALLED_JOBS_TOTAL: &str = "reel_stalled_jobs_total";
    pub const JOBS_IN_FLIGHT: &str = "reel_jobs_in_flight";
}

pub fn record_task_completed(duration_secs: f64) {
    counter!(names::TASKS_COMPLETED_TOTAL).increment(1);
    histogram!(names::TASK_DURATION_SECONDS).record(duration_secs);
}

pub fn record_task_failed(kind: &'static str) {
    counter!(names::TASKS_FAILED_TOTAL, "kind" => kind).increment(1);
}

pub fn record_task_retry(kind: &'static str) {
    counter!(names::TASK_RETRIES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_segment_synthesized() {
    counter!(names::SEGMENTS_SYNTHESIZED_TOTAL).increment(1);
}

pub fn record_refund(amount: u32) {
    counter!(names::REFUNDS_TOTAL).increment(1);
    counter!(names::REFUNDED_CREDITS_TOTAL).increment(amount as u64);
}

pub fn record_stalled(count: usize) {
    counter!(names::STALLED_JOBS_TOTAL).increment(count as u64);
}

pub fn set_jobs_in_flight(count: usize) {
    gauge!(names::JOBS_IN_FLIGHT).set(count as f64);
}
