//! Redis queue integration tests.

use std::time::Duration;

use reel_models::{JobState, Priority, TaskId};
use reel_queue::{FailOutcome, JobQueue, QueueConfig, RedisJobQueue, StallOutcome};

/// Queue on an isolated key prefix so tests do not see each other's jobs.
fn test_queue(visibility_timeout: Duration) -> RedisJobQueue {
    dotenvy::dotenv().ok();

    let config = QueueConfig {
        prefix: format!("reel-test:{}", uuid::Uuid::new_v4()),
        max_attempts: 2,
        visibility_timeout,
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        ..QueueConfig::from_env()
    };
    RedisJobQueue::new(config).expect("Failed to create queue")
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_connection() {
    let queue = test_queue(Duration::from_secs(30));
    queue.ping().await.expect("Failed to ping Redis");

    let counts = queue.counts().await.expect("Failed to get counts");
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_dedup_and_priority_order() {
    let queue = test_queue(Duration::from_secs(30));
    let normal = TaskId::new();
    let high = TaskId::new();

    assert!(queue.enqueue(normal, Priority::Normal).await.unwrap().is_new());
    assert!(!queue.enqueue(normal, Priority::Normal).await.unwrap().is_new());
    queue.enqueue(high, Priority::High).await.unwrap();

    let first = queue.dequeue("w1").await.unwrap().expect("job");
    let second = queue.dequeue("w1").await.unwrap().expect("job");
    assert_eq!(first.task_id, high);
    assert_eq!(second.task_id, normal);
    assert_eq!(second.attempt, 1);
    assert!(queue.dequeue("w1").await.unwrap().is_none());

    // Active jobs still dedup
    assert!(!queue.enqueue(normal, Priority::Low).await.unwrap().is_new());

    queue.ack(&first).await.unwrap();
    queue.ack(&second).await.unwrap();
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_fail_backoff_then_dead() {
    let queue = test_queue(Duration::from_secs(30));
    let id = TaskId::new();
    queue.enqueue(id, Priority::Normal).await.unwrap();

    let job = queue.dequeue("w1").await.unwrap().unwrap();
    let outcome = queue.fail(&job, "upstream 503", true).await.unwrap();
    assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));
    assert_eq!(queue.get(id).await.unwrap().unwrap().state, JobState::Delayed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = queue.dequeue("w2").await.unwrap().expect("retried job");
    assert_eq!(job.attempt, 2);
    assert_eq!(queue.fail(&job, "upstream 503", true).await.unwrap(), FailOutcome::Dead);

    let dead = queue.get(id).await.unwrap().unwrap();
    assert_eq!(dead.state, JobState::Failed);
    assert_eq!(dead.last_error.as_deref(), Some("upstream 503"));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stalled_job_recovered() {
    let queue = test_queue(Duration::from_millis(100));
    let id = TaskId::new();
    queue.enqueue(id, Priority::Normal).await.unwrap();

    let stale = queue.dequeue("crashed-worker").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let recovered = queue.recover_stalled().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].outcome, StallOutcome::Requeued);
    assert!(!queue.heartbeat(&stale).await.unwrap());
    assert!(queue.ack(&stale).await.is_err());

    let job = queue.dequeue("w2").await.unwrap().unwrap();
    assert_eq!(job.attempt, 2);
    assert!(queue.heartbeat(&job).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_remove_waiting_job() {
    let queue = test_queue(Duration::from_secs(30));
    let id = TaskId::new();
    queue.enqueue(id, Priority::Normal).await.unwrap();

    assert!(queue.remove(id).await.unwrap());
    assert!(queue.get(id).await.unwrap().is_none());
    assert!(queue.dequeue("w1").await.unwrap().is_none());
}
