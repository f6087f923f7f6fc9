//! Prometheus metrics for the API server.

use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use uuid::Uuid;

use reel_queue::QueueCounts;

/// Install the Prometheus recorder and return a handle for `/metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "reel_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "reel_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "reel_http_requests_in_flight";

    // Task metrics
    pub const TASKS_SUBMITTED_TOTAL: &str = "reel_tasks_submitted_total";
    pub const TASKS_DELETED_TOTAL: &str = "reel_tasks_deleted_total";
    pub const CREDITS_DEBITED_TOTAL: &str = "reel_credits_debited_total";
    pub const REFUNDS_TOTAL: &str = "reel_refunds_total";

    // Queue metrics
    pub const QUEUE_LENGTH: &str = "reel_queue_length";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record an accepted submission and the credits it cost.
pub fn record_task_submitted(priority: &str, credits: u32) {
    let labels = [("priority", priority.to_string())];
    counter!(names::TASKS_SUBMITTED_TOTAL, &labels).increment(1);
    counter!(names::CREDITS_DEBITED_TOTAL).increment(u64::from(credits));
}

/// Record a deleted task by the status it had.
pub fn record_task_deleted(status: &str) {
    let labels = [("status", status.to_string())];
    counter!(names::TASKS_DELETED_TOTAL, &labels).increment(1);
}

/// Record a refund issued by the API.
pub fn record_refund(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::REFUNDS_TOTAL, &labels).increment(1);
}

/// Update queue length gauges.
pub fn set_queue_lengths(counts: &QueueCounts) {
    for (state, value) in [
        ("waiting", counts.waiting),
        ("active", counts.active),
        ("delayed", counts.delayed),
    ] {
        gauge!(names::QUEUE_LENGTH, "state" => state).set(value as f64);
    }
}

/// Replace id path segments with placeholders for metric labels.
fn sanitize_path(path: &str) -> String {
    path.split('/')
        .map(|part| {
            let numeric = !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
            if numeric || Uuid::parse_str(part).is_ok() {
                ":id"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(
            sanitize_path("/api/tasks/550e8400-e29b-41d4-a716-446655440000"),
            "/api/tasks/:id"
        );
        assert_eq!(sanitize_path("/api/tasks/42"), "/api/tasks/:id");
        assert_eq!(sanitize_path("/api/tasks/estimate"), "/api/tasks/estimate");
        assert_eq!(sanitize_path("/"), "/");
    }
}
