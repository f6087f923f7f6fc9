//! Job executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use reel_models::{Job, ProgressEvent, ProgressKind};
use reel_queue::{FailOutcome, QueueError, StallOutcome};

use crate::compensation::{compensate, Compensation};
use crate::config::WorkerConfig;
use crate::context::PipelineDeps;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::TaskLogger;
use crate::metrics;
use crate::pipeline::TaskPipeline;
use crate::retry::FailureTracker;

/// What happened to one dequeued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Rescheduled by the queue after `delay`.
    Retrying { delay: Duration },
    /// Failed for good; the task was recorded as failed.
    Failed { refunded: bool },
    /// The lease was lost; another worker or the stall sweeper owns the job.
    Abandoned,
    /// Failed for good, but the task could not be recorded and refunded yet.
    /// The job stays in the queue so a later attempt finishes the work.
    Unsettled,
}

fn was_refunded(result: Compensation) -> bool {
    matches!(result, Compensation::Refunded { .. } | Compensation::RefundAlreadyApplied)
}

/// Pulls jobs from the queue and runs them through the pipeline.
#[derive(Clone)]
pub struct JobExecutor {
    config: WorkerConfig,
    pipeline: TaskPipeline,
    job_semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, pipeline: TaskPipeline) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config,
            pipeline,
            job_semaphore,
            tracker: TaskTracker::new(),
        }
    }

    fn deps(&self) -> &PipelineDeps {
        self.pipeline.deps()
    }

    /// Consume jobs until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.config.worker_id, self.config.max_concurrent_jobs
        );

        let jobs_cancel = CancellationToken::new();
        let sweeper = tokio::spawn({
            let executor = self.clone();
            let shutdown = shutdown.clone();
            async move { executor.stall_loop(shutdown).await }
        });

        let mut failures = FailureTracker::new(3);
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.job_semaphore.clone().acquire_owned() => permit
                    .map_err(|_| WorkerError::invalid_state("job semaphore closed"))?,
            };

            match self.deps().queue.dequeue(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    failures.record_success();
                    let executor = self.clone();
                    let cancel = jobs_cancel.child_token();
                    self.tracker.spawn(async move {
                        executor.handle_job(job, cancel).await;
                        drop(permit);
                        executor.report_in_flight();
                    });
                    self.report_in_flight();
                    continue;
                }
                Ok(None) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to dequeue job: {}", e);
                    }
                }
            }

            drop(permit);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Shutdown signal received, waiting for in-flight jobs...");
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {:?}, cancelling them",
                self.config.shutdown_timeout
            );
            jobs_cancel.cancel();
            self.tracker.wait().await;
        }

        let _ = sweeper.await;
        info!("Job executor stopped");
        Ok(())
    }

    /// Run one attempt of `job` and settle it with the queue.
    pub async fn handle_job(&self, job: Job, cancel: CancellationToken) -> JobOutcome {
        let logger = TaskLogger::for_job(&job);
        let span = logger.create_span();
        self.handle_job_inner(job, cancel, logger).instrument(span).await
    }

    async fn handle_job_inner(&self, job: Job, cancel: CancellationToken, logger: TaskLogger) -> JobOutcome {
        let started = Instant::now();
        let job_cancel = cancel.child_token();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(job.clone(), job_cancel.clone(), Arc::clone(&lease_lost));

        let result = match tokio::time::timeout(self.config.job_timeout, self.pipeline.execute(&job, &job_cancel)).await
        {
            Ok(result) => result,
            Err(_) => Err(WorkerError::transient(format!(
                "job exceeded {}s",
                self.config.job_timeout.as_secs()
            ))),
        };
        heartbeat.abort();

        if lease_lost.load(Ordering::SeqCst) {
            logger.log_warning("lease lost, abandoning attempt");
            JobOutcome::Abandoned
        } else {
            match result {
                Ok(_) => {
                    if let Err(e) = self.deps().queue.ack(&job).await {
                        logger.log_warning(&format!("failed to ack completed job: {e}"));
                    }
                    metrics::record_task_completed(started.elapsed().as_secs_f64());
                    JobOutcome::Completed
                }
                Err(e) => self.handle_failure(&job, e, &logger).await,
            }
        }
    }

    async fn handle_failure(&self, job: &Job, e: WorkerError, logger: &TaskLogger) -> JobOutcome {
        let retryable = e.is_retryable(job.attempt);
        let message = e.to_string();

        if let WorkerError::TaskNotFound(task_id) = &e {
            error!(task_id = %task_id, "Job references a task that does not exist");
        } else {
            logger.log_error(&message);
        }

        if retryable && job.attempt < self.deps().queue.max_attempts() {
            return match self.deps().queue.fail(job, &message, true).await {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    info!(
                        task_id = %job.task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Job will be retried"
                    );
                    metrics::record_task_retry(e.kind());
                    self.publish(ProgressEvent::new(
                        job.task_id,
                        ProgressKind::Failed {
                            message,
                            will_retry: true,
                        },
                    ))
                    .await;
                    JobOutcome::Retrying { delay }
                }
                // The queue's attempt limit disagrees with ours; the job is gone
                Ok(FailOutcome::Dead) => self.settle_dead(job, &e, &message).await,
                Err(queue_err) => Self::unrecorded(job, queue_err, logger),
            };
        }

        // The task is failed and refunded while the job is still leased. If
        // that does not go through, the lease runs out and the stall sweeper
        // brings the job back.
        let refunded = match compensate(self.deps(), job.task_id, &message).await {
            Ok(result) => was_refunded(result),
            Err(comp_err) => {
                error!(
                    task_id = %job.task_id,
                    "Compensation failed, leaving the job to the stall sweeper: {}", comp_err
                );
                return JobOutcome::Unsettled;
            }
        };
        metrics::record_task_failed(e.kind());

        match self.deps().queue.fail(job, &message, false).await {
            Ok(_) => {}
            Err(QueueError::LeaseLost(_)) => {
                logger.log_warning("lease lost before the failure was recorded");
            }
            Err(queue_err) => {
                // The sweeper recovers the job and compensates again
                error!(task_id = %job.task_id, "Failed to record job failure: {}", queue_err);
            }
        }
        JobOutcome::Failed { refunded }
    }

    async fn settle_dead(&self, job: &Job, e: &WorkerError, message: &str) -> JobOutcome {
        metrics::record_task_failed(e.kind());
        match compensate(self.deps(), job.task_id, message).await {
            Ok(result) => JobOutcome::Failed {
                refunded: was_refunded(result),
            },
            Err(comp_err) => {
                error!(task_id = %job.task_id, "Compensation failed: {}", comp_err);
                self.requeue_for_compensation(job).await;
                JobOutcome::Unsettled
            }
        }
    }

    fn unrecorded(job: &Job, queue_err: QueueError, logger: &TaskLogger) -> JobOutcome {
        if matches!(queue_err, QueueError::LeaseLost(_)) {
            logger.log_warning("lease lost before the failure was recorded");
        } else {
            // The lease expires and the stall sweeper takes over
            error!(task_id = %job.task_id, "Failed to record job failure: {}", queue_err);
        }
        JobOutcome::Abandoned
    }

    /// Put a dead job back so a later attempt repeats the compensation.
    ///
    /// The next attempt either finds the task `failed` and refunds it, or
    /// finds it still live and runs it again.
    async fn requeue_for_compensation(&self, job: &Job) {
        match self.deps().queue.enqueue(job.task_id, job.priority).await {
            Ok(_) => warn!(task_id = %job.task_id, "Requeued job whose compensation failed"),
            Err(e) => error!(
                task_id = %job.task_id,
                "Failed to requeue job whose compensation failed: {}", e
            ),
        }
    }

    /// Extend the lease while the job runs; cancel the job if it is lost.
    fn spawn_heartbeat(&self, job: Job, cancel: CancellationToken, lease_lost: Arc<AtomicBool>) -> JoinHandle<()> {
        let queue = Arc::clone(&self.deps().queue);
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut failures = FailureTracker::new(2);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match queue.heartbeat(&job).await {
                    Ok(true) => {
                        failures.record_success();
                        debug!(task_id = %job.task_id, "Lease extended");
                    }
                    Ok(false) => {
                        warn!(task_id = %job.task_id, attempt = job.attempt, "Lease lost, cancelling job");
                        lease_lost.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        break;
                    }
                    Err(e) => {
                        if failures.record_failure() {
                            warn!(task_id = %job.task_id, "Heartbeat failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Recover expired leases once. Jobs that ran out of attempts are
    /// compensated. Returns the number of stalled jobs found.
    pub async fn sweep_stalled(&self) -> WorkerResult<usize> {
        let stalled = self.deps().queue.recover_stalled().await?;
        if stalled.is_empty() {
            return Ok(0);
        }
        metrics::record_stalled(stalled.len());

        for entry in &stalled {
            let job = &entry.job;
            match entry.outcome {
                StallOutcome::Requeued => {
                    warn!(task_id = %job.task_id, attempt = job.attempt, "Stalled job requeued");
                }
                StallOutcome::Dead => {
                    warn!(task_id = %job.task_id, attempt = job.attempt, "Stalled job out of attempts");
                    metrics::record_task_failed("stalled");
                    let message = format!("worker stopped responding on attempt {}", job.attempt);
                    if let Err(e) = compensate(self.deps(), job.task_id, &message).await {
                        error!(task_id = %job.task_id, "Compensation failed: {}", e);
                        self.requeue_for_compensation(job).await;
                    }
                }
            }
        }
        Ok(stalled.len())
    }

    async fn stall_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.stall_check_interval);
        let mut failures = FailureTracker::new(3);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.sweep_stalled().await {
                Ok(_) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Stall sweep failed: {}", e);
                    }
                }
            }
        }
    }

    fn report_in_flight(&self) {
        let busy = self.config.max_concurrent_jobs - self.job_semaphore.available_permits();
        metrics::set_jobs_in_flight(busy);
    }

    async fn publish(&self, event: ProgressEvent) {
        if let Err(e) = self.deps().progress.publish(&event).await {
            warn!(task_id = %event.task_id, "Failed to publish progress event: {}", e);
        }
    }
}
