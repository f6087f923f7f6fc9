//! Structured task logging.

use tracing::{error, info, warn, Span};

use reel_models::{Job, TaskId};

/// Logs task lifecycle events with the task id and attempt attached.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    task_id: TaskId,
    attempt: u32,
}

impl TaskLogger {
    pub fn new(task_id: TaskId, attempt: u32) -> Self {
        Self { task_id, attempt }
    }

    pub fn for_job(job: &Job) -> Self {
        Self::new(job.task_id, job.attempt)
    }

    pub fn log_start(&self, segments: usize) {
        info!(task_id = %self.task_id, attempt = self.attempt, segments, "Task started");
    }

    pub fn log_segment(&self, index: u32, done: u32, total: u32) {
        info!(
            task_id = %self.task_id,
            attempt = self.attempt,
            index,
            "Segment {}/{} done", done, total
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(task_id = %self.task_id, attempt = self.attempt, "Task warning: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(task_id = %self.task_id, attempt = self.attempt, "Task error: {}", message);
    }

    pub fn log_completion(&self, video_url: &str) {
        info!(task_id = %self.task_id, attempt = self.attempt, video_url, "Task completed");
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Span wrapping one job attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("task", task_id = %self.task_id, attempt = self.attempt)
    }
}
