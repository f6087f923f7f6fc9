//! Task store and credit ledger contracts.

use async_trait::async_trait;

use reel_models::{Task, TaskId, TaskUpdate};

use crate::error::StoreResult;

/// Maximum attempts for optimistic read-modify-write updates.
pub const MAX_UPDATE_RETRIES: u32 = 5;

/// Base delay for linear backoff between optimistic retries (milliseconds).
pub const RETRY_BASE_DELAY_MS: u64 = 50;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    /// Key prefix for task and ledger keys
    pub prefix: String,
    /// How long refund idempotency keys are remembered
    pub refund_key_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "reel".to_string(),
            refund_key_ttl_secs: 90 * 24 * 3600,
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("STORE_PREFIX").unwrap_or(defaults.prefix),
            refund_key_ttl_secs: std::env::var("STORE_REFUND_KEY_TTL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.refund_key_ttl_secs),
        }
    }
}

/// Persistent record store for tasks.
///
/// `apply` is atomic per task: the update is validated by
/// [`Task::apply`] against the latest stored version and written only if no
/// concurrent writer got there first.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task. Fails with `AlreadyExists` on id collision.
    async fn create(&self, task: &Task) -> StoreResult<()>;

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>>;

    /// Tasks of one owner, newest first.
    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>>;

    /// Apply one state-machine update and return the updated task.
    async fn apply(&self, id: TaskId, update: TaskUpdate) -> StoreResult<Task>;

    /// Delete a task record. Returns `false` if it did not exist.
    async fn delete(&self, id: TaskId) -> StoreResult<bool>;
}

/// Credit balance per owner.
///
/// `debit` fails closed: it returns `false` instead of letting a balance go
/// negative. `refund` is idempotent per key.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, owner_id: &str) -> StoreResult<u64>;

    /// Atomically subtract `amount` if the balance covers it.
    async fn debit(&self, owner_id: &str, amount: u32) -> StoreResult<bool>;

    /// Add credits (grants, top-ups). Returns the new balance.
    async fn credit(&self, owner_id: &str, amount: u32) -> StoreResult<u64>;

    /// Return credits once per `key`. Returns `false` if the key was already used.
    async fn refund(&self, owner_id: &str, amount: u32, key: &str) -> StoreResult<bool>;
}

/// Refund idempotency key for a task.
pub fn refund_key(task_id: TaskId) -> String {
    format!("refund:{task_id}")
}
