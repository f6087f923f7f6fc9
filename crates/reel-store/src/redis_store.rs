//! Redis-backed task store and credit ledger.
//!
//! Tasks are stored as `{prefix}:task:{id}` hashes holding `version` and the
//! JSON `data`. Updates read the record, apply the transition in Rust and
//! write back through a compare-and-set on `version`, retrying on conflict.
//! Balances are plain integers under `{prefix}:credits:{owner}`; debit and
//! refund are Lua scripts so each is a single atomic step.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tracing::{debug, info, warn};

use reel_models::{Task, TaskId, TaskUpdate};

use crate::error::{StoreError, StoreResult};
use crate::store::{CreditLedger, StoreConfig, TaskStore, MAX_UPDATE_RETRIES, RETRY_BASE_DELAY_MS};

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'version', 1, 'data', ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

const CAS_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'version') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'version', tonumber(ARGV[1]) + 1, 'data', ARGV[2])
return 1
"#;

const DELETE_SCRIPT: &str = r#"
local removed = redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return removed
"#;

const DEBIT_SCRIPT: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if balance < amount then
  return -1
end
return redis.call('DECRBY', KEYS[1], amount)
"#;

const REFUND_SCRIPT: &str = r#"
if redis.call('SET', KEYS[2], ARGV[2], 'NX', 'EX', ARGV[3]) == false then
  return -1
end
return redis.call('INCRBY', KEYS[1], ARGV[1])
"#;

/// Shared Redis handle for the store and ledger.
#[derive(Clone)]
struct RedisHandle {
    client: redis::Client,
    config: StoreConfig,
}

impl RedisHandle {
    fn new(config: StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.config.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }
}

/// Redis [`TaskStore`] with optimistic versioned updates.
pub struct RedisTaskStore {
    redis: RedisHandle,
    create: Script,
    cas: Script,
    delete: Script,
}

impl RedisTaskStore {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        Ok(Self {
            redis: RedisHandle::new(config)?,
            create: Script::new(CREATE_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
        })
    }

    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    /// Check connectivity.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.redis.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn task_key(&self, id: TaskId) -> String {
        self.redis.key(&["task", &id.to_string()])
    }

    fn owner_key(&self, owner_id: &str) -> String {
        self.redis.key(&["owner", owner_id, "tasks"])
    }

    async fn read_versioned(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: TaskId,
    ) -> StoreResult<Option<(String, Task)>> {
        let (version, data): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.task_key(id))
            .arg("version")
            .arg("data")
            .query_async(conn)
            .await?;

        match (version, data) {
            (Some(version), Some(data)) => Ok(Some((version, serde_json::from_str(&data)?))),
            (None, None) => Ok(None),
            _ => Err(StoreError::Corrupt(format!("task {id} missing version or data"))),
        }
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, task: &Task) -> StoreResult<()> {
        let mut conn = self.redis.conn().await?;
        let created: i64 = self
            .create
            .key(self.task_key(task.id))
            .key(self.owner_key(&task.owner_id))
            .arg(serde_json::to_string(task)?)
            .arg(task.created_at.timestamp_millis())
            .arg(task.id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(StoreError::AlreadyExists(task.id));
        }
        debug!(task_id = %task.id, owner_id = %task.owner_id, "Created task record");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let mut conn = self.redis.conn().await?;
        Ok(self.read_versioned(&mut conn, id).await?.map(|(_, task)| task))
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>> {
        let mut conn = self.redis.conn().await?;
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.owner_key(owner_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = TaskId::parse(&raw) else {
                warn!(owner_id, id = %raw, "Skipping malformed task id in owner index");
                continue;
            };
            if let Some((_, task)) = self.read_versioned(&mut conn, id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn apply(&self, id: TaskId, update: TaskUpdate) -> StoreResult<Task> {
        let mut conn = self.redis.conn().await?;

        for attempt in 0..MAX_UPDATE_RETRIES {
            let (version, mut task) = self
                .read_versioned(&mut conn, id)
                .await?
                .ok_or(StoreError::NotFound(id))?;

            task.apply(update.clone())?;

            let written: i64 = self
                .cas
                .key(self.task_key(id))
                .arg(&version)
                .arg(serde_json::to_string(&task)?)
                .invoke_async(&mut conn)
                .await?;

            if written == 1 {
                return Ok(task);
            }

            warn!(
                task_id = %id,
                update = update.name(),
                attempt = attempt + 1,
                "Task version changed concurrently, retrying"
            );
            let delay = Duration::from_millis(RETRY_BASE_DELAY_MS * (attempt as u64 + 1));
            tokio::time::sleep(delay).await;
        }

        warn!(
            task_id = %id,
            retries = MAX_UPDATE_RETRIES,
            "Task update failed after retries"
        );
        Err(StoreError::conflict(format!(
            "task {id} changed concurrently {MAX_UPDATE_RETRIES} times"
        )))
    }

    async fn delete(&self, id: TaskId) -> StoreResult<bool> {
        let mut conn = self.redis.conn().await?;
        let Some((_, task)) = self.read_versioned(&mut conn, id).await? else {
            return Ok(false);
        };

        let removed: i64 = self
            .delete
            .key(self.task_key(id))
            .key(self.owner_key(&task.owner_id))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

/// Redis [`CreditLedger`].
pub struct RedisCreditLedger {
    redis: RedisHandle,
    debit: Script,
    refund: Script,
}

impl RedisCreditLedger {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        Ok(Self {
            redis: RedisHandle::new(config)?,
            debit: Script::new(DEBIT_SCRIPT),
            refund: Script::new(REFUND_SCRIPT),
        })
    }

    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    fn balance_key(&self, owner_id: &str) -> String {
        self.redis.key(&["credits", owner_id])
    }

    fn refund_marker_key(&self, key: &str) -> String {
        self.redis.key(&["ledger", key])
    }
}

#[async_trait]
impl CreditLedger for RedisCreditLedger {
    async fn balance(&self, owner_id: &str) -> StoreResult<u64> {
        let mut conn = self.redis.conn().await?;
        let balance: Option<i64> = redis::cmd("GET")
            .arg(self.balance_key(owner_id))
            .query_async(&mut conn)
            .await?;
        Ok(balance.unwrap_or(0).max(0) as u64)
    }

    async fn debit(&self, owner_id: &str, amount: u32) -> StoreResult<bool> {
        let mut conn = self.redis.conn().await?;
        let result: i64 = self
            .debit
            .key(self.balance_key(owner_id))
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;

        if result < 0 {
            debug!(owner_id, amount, "Debit rejected");
            return Ok(false);
        }
        debug!(owner_id, amount, balance = result, "Debited credits");
        Ok(true)
    }

    async fn credit(&self, owner_id: &str, amount: u32) -> StoreResult<u64> {
        let mut conn = self.redis.conn().await?;
        let balance: i64 = redis::cmd("INCRBY")
            .arg(self.balance_key(owner_id))
            .arg(amount)
            .query_async(&mut conn)
            .await?;
        Ok(balance.max(0) as u64)
    }

    async fn refund(&self, owner_id: &str, amount: u32, key: &str) -> StoreResult<bool> {
        let mut conn = self.redis.conn().await?;
        let result: i64 = self
            .refund
            .key(self.balance_key(owner_id))
            .key(self.refund_marker_key(key))
            .arg(amount)
            .arg(owner_id)
            .arg(self.redis.config.refund_key_ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        if result < 0 {
            debug!(owner_id, key, "Refund already applied");
            return Ok(false);
        }
        info!(owner_id, amount, key, balance = result, "Refunded credits");
        Ok(true)
    }
}
