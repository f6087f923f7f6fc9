//! Job queue on Redis sorted sets.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:job:{task_id}`: hash with the job record
//! - `{prefix}:waiting`: zset scored by `rank * 1e13 + seq` (priority, then FIFO)
//! - `{prefix}:delayed`: zset scored by ready time (ms)
//! - `{prefix}:active`: zset scored by lease deadline (ms)
//! - `{prefix}:completed` / `{prefix}:failed`: zsets scored by finish time (ms)
//! - `{prefix}:seq`: FIFO counter
//!
//! Every state change is a single Lua script, so concurrent workers never
//! observe a half-applied transition. Timestamps come from the caller's clock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{debug, info, warn};

use reel_models::{Job, JobState, Priority, TaskId};

use crate::error::{QueueError, QueueResult};
use crate::queue::{
    Enqueued, FailOutcome, JobQueue, QueueConfig, QueueCounts, StallOutcome, StalledJob,
};

const ENQUEUE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'waiting' or state == 'active' or state == 'delayed' then
  return {0, redis.call('HGETALL', KEYS[1])}
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
local seq = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[1],
  'task_id', ARGV[1], 'priority', ARGV[2], 'rank', ARGV[3],
  'attempt', 0, 'enqueued_at', ARGV[4], 'state', 'waiting')
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) * 10000000000000 + seq, ARGV[1])
return {1, redis.call('HGETALL', KEYS[1])}
"#;

const DEQUEUE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
  local key = ARGV[4] .. id
  local rank = tonumber(redis.call('HGET', key, 'rank') or '1')
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZREM', KEYS[2], id)
  redis.call('HSET', key, 'state', 'waiting')
  redis.call('HDEL', key, 'ready_at')
  redis.call('ZADD', KEYS[1], rank * 10000000000000 + seq, id)
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local id = popped[1]
local key = ARGV[4] .. id
local lease = now + tonumber(ARGV[2])
redis.call('HINCRBY', key, 'attempt', 1)
redis.call('HSET', key, 'state', 'active', 'worker_id', ARGV[3], 'lease_until', lease)
redis.call('ZADD', KEYS[3], lease, id)
return redis.call('HGETALL', key)
"#;

// Ownership check shared by heartbeat/ack/fail: ARGV[1] worker, ARGV[2] attempt.
const OWNED_GUARD: &str = r#"
local owned = redis.call('HGET', KEYS[1], 'state') == 'active'
  and redis.call('HGET', KEYS[1], 'worker_id') == ARGV[1]
  and redis.call('HGET', KEYS[1], 'attempt') == ARGV[2]
"#;

const HEARTBEAT_BODY: &str = r#"
if not owned then
  return 0
end
local lease = tonumber(ARGV[4]) + tonumber(ARGV[5])
redis.call('HSET', KEYS[1], 'lease_until', lease)
redis.call('ZADD', KEYS[2], lease, ARGV[3])
return 1
"#;

const ACK_BODY: &str = r#"
if not owned then
  return 0
end
local now = tonumber(ARGV[4])
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('HSET', KEYS[1], 'state', 'completed', 'finished_at', now)
redis.call('HDEL', KEYS[1], 'lease_until')
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('ZADD', KEYS[3], now, ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', now - tonumber(ARGV[5]) * 1000)
return 1
"#;

const FAIL_BODY: &str = r#"
if not owned then
  return -1
end
local now = tonumber(ARGV[4])
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('HDEL', KEYS[1], 'lease_until')
redis.call('HSET', KEYS[1], 'last_error', ARGV[6])
if ARGV[7] == '1' and tonumber(ARGV[2]) < tonumber(ARGV[8]) then
  local ready = now + tonumber(ARGV[9])
  redis.call('HSET', KEYS[1], 'state', 'delayed', 'ready_at', ready)
  redis.call('ZADD', KEYS[3], ready, ARGV[3])
  return 1
end
redis.call('HSET', KEYS[1], 'state', 'failed', 'finished_at', now)
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('ZADD', KEYS[4], now, ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', now - tonumber(ARGV[5]) * 1000)
return 0
"#;

const RECOVER_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local max_attempts = tonumber(ARGV[2])
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
local out = {}
for _, id in ipairs(expired) do
  local key = ARGV[3] .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', key, 'lease_until')
  redis.call('HSET', key, 'last_error', 'lease expired')
  local attempt = tonumber(redis.call('HGET', key, 'attempt') or '0')
  if attempt < max_attempts then
    local rank = tonumber(redis.call('HGET', key, 'rank') or '1')
    local seq = redis.call('INCR', KEYS[4])
    redis.call('HSET', key, 'state', 'waiting')
    redis.call('ZADD', KEYS[2], rank * 10000000000000 + seq, id)
    table.insert(out, id)
    table.insert(out, 'requeued')
  else
    redis.call('HSET', key, 'state', 'failed', 'finished_at', now)
    redis.call('EXPIRE', key, ARGV[4])
    redis.call('ZADD', KEYS[3], now, id)
    table.insert(out, id)
    table.insert(out, 'dead')
  end
end
return out
"#;

const REMOVE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'waiting' or state == 'delayed' then
  redis.call('ZREM', KEYS[2], ARGV[1])
  redis.call('ZREM', KEYS[3], ARGV[1])
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

/// Redis-backed [`JobQueue`].
pub struct RedisJobQueue {
    client: redis::Client,
    config: QueueConfig,
    enqueue: Script,
    dequeue: Script,
    heartbeat: Script,
    ack: Script,
    fail: Script,
    recover: Script,
    remove: Script,
}

impl RedisJobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            enqueue: Script::new(ENQUEUE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
            heartbeat: Script::new(&format!("{OWNED_GUARD}{HEARTBEAT_BODY}")),
            ack: Script::new(&format!("{OWNED_GUARD}{ACK_BODY}")),
            fail: Script::new(&format!("{OWNED_GUARD}{FAIL_BODY}")),
            recover: Script::new(RECOVER_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Check connectivity.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.config.prefix, name)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.config.prefix)
    }

    fn job_key(&self, task_id: TaskId) -> String {
        format!("{}{}", self.job_key_prefix(), task_id)
    }

    fn ttl_secs(&self) -> u64 {
        self.config.finished_ttl.as_secs().max(1)
    }

    fn lease_ms(&self) -> u64 {
        self.config.visibility_timeout.as_millis() as u64
    }

    fn worker_of(job: &Job) -> &str {
        job.worker_id.as_deref().unwrap_or("")
    }

    async fn fetch(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task_id: TaskId,
    ) -> QueueResult<Option<Job>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(task_id))
            .query_async(conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(&fields).map(Some)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(value: Option<&String>) -> QueueResult<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(raw) => {
            // Lua may render large numbers as floats
            let ms = raw
                .parse::<i64>()
                .or_else(|_| raw.parse::<f64>().map(|f| f as i64))
                .map_err(|_| QueueError::invalid_record(format!("bad timestamp {raw}")))?;
            Ok(DateTime::from_timestamp_millis(ms))
        }
    }
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut it = flat.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        map.insert(k, v);
    }
    map
}

fn job_from_fields(fields: &HashMap<String, String>) -> QueueResult<Job> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::invalid_record(format!("missing field {name}")))
    };

    let task_id = TaskId::parse(field("task_id")?)
        .map_err(|e| QueueError::invalid_record(e.to_string()))?;
    let priority: Priority = field("priority")?.parse().map_err(QueueError::InvalidRecord)?;
    let state: JobState = field("state")?.parse().map_err(QueueError::InvalidRecord)?;
    let attempt = field("attempt")?
        .parse()
        .map_err(|_| QueueError::invalid_record("bad attempt"))?;
    let enqueued_at = ms_to_datetime(fields.get("enqueued_at"))?
        .ok_or_else(|| QueueError::invalid_record("missing enqueued_at"))?;

    Ok(Job {
        task_id,
        priority,
        attempt,
        enqueued_at,
        state,
        worker_id: fields.get("worker_id").cloned(),
        last_error: fields.get("last_error").cloned(),
        ready_at: ms_to_datetime(fields.get("ready_at"))?,
        lease_until: ms_to_datetime(fields.get("lease_until"))?,
    })
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, task_id: TaskId, priority: Priority) -> QueueResult<Enqueued> {
        let mut conn = self.conn().await?;
        let (created, flat): (i64, Vec<String>) = self
            .enqueue
            .key(self.job_key(task_id))
            .key(self.key("waiting"))
            .key(self.key("seq"))
            .key(self.key("completed"))
            .key(self.key("failed"))
            .arg(task_id.to_string())
            .arg(priority.as_str())
            .arg(priority.rank() as u32)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        let job = job_from_fields(&pairs_to_map(flat))?;
        if created == 1 {
            info!(task_id = %task_id, priority = %priority, "Enqueued job");
            Ok(Enqueued::New(job))
        } else {
            debug!(task_id = %task_id, state = %job.state, "Duplicate enqueue ignored");
            Ok(Enqueued::Existing(job))
        }
    }

    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let flat: Option<Vec<String>> = self
            .dequeue
            .key(self.key("waiting"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .key(self.key("seq"))
            .arg(now_ms())
            .arg(self.lease_ms())
            .arg(worker_id)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;

        match flat {
            Some(flat) if !flat.is_empty() => {
                let job = job_from_fields(&pairs_to_map(flat))?;
                debug!(task_id = %job.task_id, attempt = job.attempt, worker_id, "Claimed job");
                Ok(Some(job))
            }
            _ => Ok(None),
        }
    }

    async fn heartbeat(&self, job: &Job) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let extended: i64 = self
            .heartbeat
            .key(self.job_key(job.task_id))
            .key(self.key("active"))
            .arg(Self::worker_of(job))
            .arg(job.attempt)
            .arg(job.task_id.to_string())
            .arg(now_ms())
            .arg(self.lease_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let acked: i64 = self
            .ack
            .key(self.job_key(job.task_id))
            .key(self.key("active"))
            .key(self.key("completed"))
            .arg(Self::worker_of(job))
            .arg(job.attempt)
            .arg(job.task_id.to_string())
            .arg(now_ms())
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;

        if acked != 1 {
            return Err(QueueError::LeaseLost(job.task_id));
        }
        debug!(task_id = %job.task_id, "Acknowledged job");
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str, retryable: bool) -> QueueResult<FailOutcome> {
        let mut conn = self.conn().await?;
        let delay = self.config.backoff_delay(job.attempt);
        let result: i64 = self
            .fail
            .key(self.job_key(job.task_id))
            .key(self.key("active"))
            .key(self.key("delayed"))
            .key(self.key("failed"))
            .arg(Self::worker_of(job))
            .arg(job.attempt)
            .arg(job.task_id.to_string())
            .arg(now_ms())
            .arg(self.ttl_secs())
            .arg(error)
            .arg(if retryable { "1" } else { "0" })
            .arg(self.config.max_attempts)
            .arg(delay.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => {
                warn!(
                    task_id = %job.task_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job rescheduled"
                );
                Ok(FailOutcome::Retrying {
                    attempt: job.attempt,
                    delay,
                })
            }
            0 => {
                warn!(task_id = %job.task_id, attempt = job.attempt, error, "Job failed permanently");
                Ok(FailOutcome::Dead)
            }
            _ => Err(QueueError::LeaseLost(job.task_id)),
        }
    }

    async fn recover_stalled(&self) -> QueueResult<Vec<StalledJob>> {
        let mut conn = self.conn().await?;
        let flat: Vec<String> = self
            .recover
            .key(self.key("active"))
            .key(self.key("waiting"))
            .key(self.key("failed"))
            .key(self.key("seq"))
            .arg(now_ms())
            .arg(self.config.max_attempts)
            .arg(self.job_key_prefix())
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;

        let mut recovered = Vec::new();
        for (id, outcome) in pairs_to_map(flat) {
            let task_id =
                TaskId::parse(&id).map_err(|e| QueueError::invalid_record(e.to_string()))?;
            let outcome = if outcome == "dead" {
                StallOutcome::Dead
            } else {
                StallOutcome::Requeued
            };
            let job = self
                .fetch(&mut conn, task_id)
                .await?
                .ok_or(QueueError::JobNotFound(task_id))?;
            warn!(task_id = %task_id, attempt = job.attempt, ?outcome, "Recovered stalled job");
            recovered.push(StalledJob { job, outcome });
        }
        Ok(recovered)
    }

    async fn remove(&self, task_id: TaskId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .remove
            .key(self.job_key(task_id))
            .key(self.key("waiting"))
            .key(self.key("delayed"))
            .arg(task_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        if removed == 1 {
            info!(task_id = %task_id, "Removed queued job");
        }
        Ok(removed == 1)
    }

    async fn get(&self, task_id: TaskId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        self.fetch(&mut conn, task_id).await
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.conn().await?;
        let cutoff = now_ms() - (self.ttl_secs() as i64) * 1000;
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(self.key("completed"))
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(self.key("failed"))
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(self.key("waiting"))
            .cmd("ZCARD")
            .arg(self.key("active"))
            .cmd("ZCARD")
            .arg(self.key("delayed"))
            .cmd("ZCARD")
            .arg(self.key("completed"))
            .cmd("ZCARD")
            .arg(self.key("failed"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}
