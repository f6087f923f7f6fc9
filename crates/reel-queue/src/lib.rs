//! Priority job queue for generation tasks.
//!
//! This crate provides:
//! - The `JobQueue` contract: dedup by task id, priority + FIFO claim,
//!   leases with heartbeat, exponential backoff, stall recovery
//! - A Redis implementation (sorted sets + Lua) and an in-memory one
//! - Progress events via Redis Pub/Sub

pub mod error;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod redis_queue;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryJobQueue;
pub use progress::{NoopPublisher, ProgressChannel, ProgressPublisher};
pub use queue::{
    Enqueued, FailOutcome, JobQueue, QueueConfig, QueueCounts, StallOutcome, StalledJob,
};
pub use redis_queue::RedisJobQueue;
