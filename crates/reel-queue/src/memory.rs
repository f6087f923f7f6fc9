//! In-process queue with the same semantics as the Redis queue.
//!
//! Used by tests and single-process local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use reel_models::{Job, JobState, Priority, TaskId};

use crate::error::{QueueError, QueueResult};
use crate::queue::{
    Enqueued, FailOutcome, JobQueue, QueueConfig, QueueCounts, StallOutcome, StalledJob,
};

struct Entry {
    job: Job,
    /// FIFO position within the priority, refreshed on every requeue
    seq: u64,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<TaskId, Entry>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn owned_mut(&mut self, job: &Job) -> QueueResult<&mut Entry> {
        match self.jobs.get_mut(&job.task_id) {
            Some(entry)
                if entry.job.state == JobState::Active
                    && entry.job.worker_id == job.worker_id
                    && entry.job.attempt == job.attempt =>
            {
                Ok(entry)
            }
            _ => Err(QueueError::LeaseLost(job.task_id)),
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<TaskId> = self
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Delayed && e.job.ready_at.is_some_and(|t| t <= now))
            .map(|e| e.job.task_id)
            .collect();
        for id in due {
            let seq = self.next_seq();
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.job.state = JobState::Waiting;
                entry.job.ready_at = None;
                entry.seq = seq;
            }
        }
    }

    fn purge_finished(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        self.jobs
            .retain(|_, e| e.finished_at.map_or(true, |at| at + ttl > now));
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Queue backed by a tokio mutex.
pub struct MemoryJobQueue {
    config: QueueConfig,
    state: Mutex<State>,
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lease(&self) -> chrono::Duration {
        to_chrono(self.config.visibility_timeout)
    }

    fn finished_ttl(&self) -> chrono::Duration {
        to_chrono(self.config.finished_ttl)
    }

    fn finish(entry: &mut Entry, state: JobState, now: DateTime<Utc>) {
        entry.job.state = state;
        entry.job.lease_until = None;
        entry.finished_at = Some(now);
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, task_id: TaskId, priority: Priority) -> QueueResult<Enqueued> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.jobs.get(&task_id) {
            if entry.job.state.is_live() {
                debug!(task_id = %task_id, state = %entry.job.state, "Duplicate enqueue ignored");
                return Ok(Enqueued::Existing(entry.job.clone()));
            }
        }

        let job = Job::new(task_id, priority);
        let seq = state.next_seq();
        state.jobs.insert(
            task_id,
            Entry {
                job: job.clone(),
                seq,
                finished_at: None,
            },
        );
        info!(task_id = %task_id, priority = %priority, "Enqueued job");
        Ok(Enqueued::New(job))
    }

    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let now = Utc::now();
        let lease = self.lease();
        let mut state = self.state.lock().await;
        state.purge_finished(now, self.finished_ttl());
        state.promote_due(now);

        let next = state
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Waiting)
            .min_by_key(|e| (e.job.priority.rank(), e.seq))
            .map(|e| e.job.task_id);

        let Some(task_id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&task_id) else {
            return Ok(None);
        };

        entry.job.state = JobState::Active;
        entry.job.attempt += 1;
        entry.job.worker_id = Some(worker_id.to_string());
        entry.job.lease_until = Some(now + lease);
        debug!(task_id = %task_id, attempt = entry.job.attempt, worker_id, "Claimed job");
        Ok(Some(entry.job.clone()))
    }

    async fn heartbeat(&self, job: &Job) -> QueueResult<bool> {
        let lease = self.lease();
        let mut state = self.state.lock().await;
        match state.owned_mut(job) {
            Ok(entry) => {
                entry.job.lease_until = Some(Utc::now() + lease);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let entry = state.owned_mut(job)?;
        Self::finish(entry, JobState::Completed, now);
        debug!(task_id = %job.task_id, "Acknowledged job");
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> QueueResult<FailOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let entry = state.owned_mut(job)?;
        entry.job.last_error = Some(error.to_string());

        let attempt = entry.job.attempt;
        if retryable && attempt < self.config.max_attempts {
            let delay = self.config.backoff_delay(attempt);
            entry.job.state = JobState::Delayed;
            entry.job.lease_until = None;
            entry.job.ready_at = Some(now + to_chrono(delay));
            warn!(task_id = %job.task_id, attempt, delay_ms = delay.as_millis() as u64, "Job rescheduled");
            return Ok(FailOutcome::Retrying { attempt, delay });
        }

        Self::finish(entry, JobState::Failed, now);
        warn!(task_id = %job.task_id, attempt, error, "Job failed permanently");
        Ok(FailOutcome::Dead)
    }

    async fn recover_stalled(&self) -> QueueResult<Vec<StalledJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<TaskId> = state
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Active && e.job.lease_until.is_some_and(|t| t <= now))
            .map(|e| e.job.task_id)
            .collect();

        let mut recovered = Vec::with_capacity(expired.len());
        for task_id in expired {
            let seq = state.next_seq();
            let Some(entry) = state.jobs.get_mut(&task_id) else {
                continue;
            };
            entry.job.last_error = Some("lease expired".to_string());

            let outcome = if entry.job.attempt < self.config.max_attempts {
                entry.job.state = JobState::Waiting;
                entry.job.lease_until = None;
                entry.seq = seq;
                StallOutcome::Requeued
            } else {
                Self::finish(entry, JobState::Failed, now);
                StallOutcome::Dead
            };
            warn!(task_id = %task_id, attempt = entry.job.attempt, ?outcome, "Recovered stalled job");
            recovered.push(StalledJob {
                job: entry.job.clone(),
                outcome,
            });
        }
        Ok(recovered)
    }

    async fn remove(&self, task_id: TaskId) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let removable = state
            .jobs
            .get(&task_id)
            .is_some_and(|e| matches!(e.job.state, JobState::Waiting | JobState::Delayed));
        if removable {
            state.jobs.remove(&task_id);
            info!(task_id = %task_id, "Removed queued job");
        }
        Ok(removable)
    }

    async fn get(&self, task_id: TaskId) -> QueueResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&task_id).map(|e| e.job.clone()))
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for entry in state.jobs.values() {
            match entry.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn queue() -> MemoryJobQueue {
        MemoryJobQueue::new(QueueConfig {
            max_attempts: 3,
            visibility_timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_enqueue_dedup() {
        let q = queue();
        let id = TaskId::new();

        assert!(q.enqueue(id, Priority::Normal).await.unwrap().is_new());
        let second = q.enqueue(id, Priority::High).await.unwrap();
        assert!(!second.is_new());
        assert_eq!(second.job().priority, Priority::Normal);

        // Still a duplicate while active
        q.dequeue("w1").await.unwrap().unwrap();
        assert!(!q.enqueue(id, Priority::Normal).await.unwrap().is_new());
        assert_eq!(q.counts().await.unwrap().active, 1);
        assert_eq!(q.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let q = queue();
        let low = TaskId::new();
        let normal_a = TaskId::new();
        let high = TaskId::new();
        let normal_b = TaskId::new();

        q.enqueue(low, Priority::Low).await.unwrap();
        q.enqueue(normal_a, Priority::Normal).await.unwrap();
        q.enqueue(high, Priority::High).await.unwrap();
        q.enqueue(normal_b, Priority::Normal).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = q.dequeue("w").await.unwrap() {
            order.push(job.task_id);
        }
        assert_eq!(order, vec![high, normal_a, normal_b, low]);
    }

    #[tokio::test]
    async fn test_dequeue_claims_with_lease() {
        let q = queue();
        let id = TaskId::new();
        q.enqueue(id, Priority::Normal).await.unwrap();

        let job = q.dequeue("worker-7").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.worker_id.as_deref(), Some("worker-7"));
        assert!(job.lease_until.is_some());
        assert!(q.dequeue("worker-8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_retries_with_backoff_then_dies() {
        let q = queue();
        let id = TaskId::new();
        q.enqueue(id, Priority::Normal).await.unwrap();

        let job = q.dequeue("w").await.unwrap().unwrap();
        let outcome = q.fail(&job, "timeout", true).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(q.get(id).await.unwrap().unwrap().state, JobState::Delayed);

        // Not yet due
        assert!(q.dequeue("w").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job = q.dequeue("w").await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert!(matches!(
            q.fail(&job, "timeout", true).await.unwrap(),
            FailOutcome::Retrying { attempt: 2, .. }
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let job = q.dequeue("w").await.unwrap().unwrap();
        assert_eq!(job.attempt, 3);
        assert_eq!(q.fail(&job, "timeout", true).await.unwrap(), FailOutcome::Dead);

        let dead = q.get(id).await.unwrap().unwrap();
        assert_eq!(dead.state, JobState::Failed);
        assert_eq!(dead.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let q = queue();
        let id = TaskId::new();
        q.enqueue(id, Priority::Normal).await.unwrap();
        let job = q.dequeue("w").await.unwrap().unwrap();

        assert_eq!(q.fail(&job, "bad input", false).await.unwrap(), FailOutcome::Dead);
        assert_eq!(q.counts().await.unwrap().failed, 1);

        // Finished jobs can be enqueued again
        assert!(q.enqueue(id, Priority::Normal).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_stalled_job_requeued_then_dead() {
        let q = MemoryJobQueue::new(QueueConfig {
            max_attempts: 2,
            visibility_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let id = TaskId::new();
        q.enqueue(id, Priority::Normal).await.unwrap();

        let first = q.dequeue("crashed").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stalled = q.recover_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].outcome, StallOutcome::Requeued);

        // The old claimant lost its lease
        assert!(!q.heartbeat(&first).await.unwrap());
        assert!(matches!(q.ack(&first).await, Err(QueueError::LeaseLost(_))));

        let second = q.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stalled = q.recover_stalled().await.unwrap();
        assert_eq!(stalled[0].outcome, StallOutcome::Dead);
        assert_eq!(stalled[0].job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease() {
        let q = queue();
        let id = TaskId::new();
        q.enqueue(id, Priority::Normal).await.unwrap();
        let job = q.dequeue("w").await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert!(q.heartbeat(&job).await.unwrap());
        }
        assert!(q.recover_stalled().await.unwrap().is_empty());
        q.ack(&job).await.unwrap();
        assert_eq!(q.get(id).await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_remove_only_waiting_or_delayed() {
        let q = queue();
        let waiting = TaskId::new();
        let active = TaskId::new();
        q.enqueue(active, Priority::High).await.unwrap();
        q.enqueue(waiting, Priority::Normal).await.unwrap();
        q.dequeue("w").await.unwrap().unwrap();

        assert!(!q.remove(active).await.unwrap());
        assert!(q.remove(waiting).await.unwrap());
        assert!(q.get(waiting).await.unwrap().is_none());
        assert!(!q.remove(TaskId::new()).await.unwrap());
    }
}
