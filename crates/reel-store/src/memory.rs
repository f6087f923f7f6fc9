//! In-memory task store and credit ledger.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use reel_models::{Task, TaskId, TaskUpdate};

use crate::error::{StoreError, StoreResult};
use crate::store::{CreditLedger, TaskStore};

/// Task store backed by a `RwLock<HashMap>`.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &Task) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut owned: Vec<Task> = tasks
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn apply(&self, id: TaskId, update: TaskUpdate) -> StoreResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Validate on a copy so a rejected update leaves the record untouched
        let mut next = task.clone();
        next.apply(update)?;
        *task = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: TaskId) -> StoreResult<bool> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }
}

#[derive(Default)]
struct Ledger {
    balances: HashMap<String, u64>,
    refund_keys: HashSet<String>,
}

/// Credit ledger behind a mutex. Every operation is one critical section.
pub struct MemoryCreditLedger {
    ledger: Mutex<Ledger>,
    /// Balance of an owner seen for the first time
    opening_balance: u64,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::with_opening_balance(0)
    }

    /// Ledger where unknown owners start with `opening_balance` credits.
    pub fn with_opening_balance(opening_balance: u64) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            opening_balance,
        }
    }

    /// Set an owner's balance directly.
    pub async fn set_balance(&self, owner_id: &str, balance: u64) {
        self.ledger
            .lock()
            .await
            .balances
            .insert(owner_id.to_string(), balance);
    }
}

impl Default for MemoryCreditLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn balance(&self, owner_id: &str) -> StoreResult<u64> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .balances
            .get(owner_id)
            .copied()
            .unwrap_or(self.opening_balance))
    }

    async fn debit(&self, owner_id: &str, amount: u32) -> StoreResult<bool> {
        let mut ledger = self.ledger.lock().await;
        let balance = ledger
            .balances
            .entry(owner_id.to_string())
            .or_insert(self.opening_balance);
        if *balance < amount as u64 {
            debug!(owner_id, amount, balance = *balance, "Debit rejected");
            return Ok(false);
        }
        *balance -= amount as u64;
        Ok(true)
    }

    async fn credit(&self, owner_id: &str, amount: u32) -> StoreResult<u64> {
        let mut ledger = self.ledger.lock().await;
        let balance = ledger
            .balances
            .entry(owner_id.to_string())
            .or_insert(self.opening_balance);
        *balance += amount as u64;
        Ok(*balance)
    }

    async fn refund(&self, owner_id: &str, amount: u32, key: &str) -> StoreResult<bool> {
        let mut ledger = self.ledger.lock().await;
        if !ledger.refund_keys.insert(key.to_string()) {
            debug!(owner_id, key, "Refund already applied");
            return Ok(false);
        }
        let opening = self.opening_balance;
        let balance = ledger.balances.entry(owner_id.to_string()).or_insert(opening);
        *balance += amount as u64;
        info!(owner_id, amount, key, "Refunded credits");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use reel_models::{
        estimate_cost, segment, Priority, SegmentationStrategy, TaskSpec, TaskStatus, TemplateRef,
        TransitionError, VoiceParams, VoiceRef,
    };

    use super::*;

    fn task(owner: &str) -> Task {
        let text = "A short narration for the store tests.";
        let spec = TaskSpec {
            source_text: text.to_string(),
            voice: VoiceRef::preset("narrator"),
            voice_params: VoiceParams::default(),
            template: TemplateRef {
                template_id: "anchor".into(),
                video_url: None,
            },
            is_custom_template: false,
            priority: Priority::Normal,
            strategy: SegmentationStrategy::Auto,
        };
        let plan = segment(text, SegmentationStrategy::Auto).unwrap();
        let cost = estimate_cost(text, false, false).unwrap();
        Task::new(owner, spec, plan, cost)
    }

    #[tokio::test]
    async fn test_create_get_apply() {
        let store = MemoryTaskStore::new();
        let t = task("owner");
        store.create(&t).await.unwrap();
        assert!(matches!(store.create(&t).await, Err(StoreError::AlreadyExists(_))));

        let updated = store.apply(t.id, TaskUpdate::Start).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Processing);
        assert_eq!(store.get(t.id).await.unwrap().unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_record() {
        let store = MemoryTaskStore::new();
        let t = task("owner");
        store.create(&t).await.unwrap();

        let err = store.apply(t.id, TaskUpdate::MarkRefunded).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError::InvalidTransition { .. })
        ));
        assert_eq!(store.get(t.id).await.unwrap().unwrap(), t);
        assert!(matches!(
            store.apply(TaskId::new(), TaskUpdate::Start).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = MemoryTaskStore::new();
        let first = task("alice");
        let mut second = task("alice");
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();
        store.create(&task("bob")).await.unwrap();

        let listed = store.list_by_owner("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);

        assert!(store.delete(first.id).await.unwrap());
        assert!(!store.delete(first.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_debit_fails_closed() {
        let ledger = MemoryCreditLedger::new();
        ledger.set_balance("u", 10).await;

        assert!(!ledger.debit("u", 11).await.unwrap());
        assert_eq!(ledger.balance("u").await.unwrap(), 10);
        assert!(ledger.debit("u", 10).await.unwrap());
        assert_eq!(ledger.balance("u").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refund_is_idempotent() {
        let ledger = MemoryCreditLedger::new();
        ledger.set_balance("u", 30).await;
        ledger.debit("u", 25).await.unwrap();

        assert!(ledger.refund("u", 25, "refund:t1").await.unwrap());
        assert!(!ledger.refund("u", 25, "refund:t1").await.unwrap());
        assert_eq!(ledger.balance("u").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_opening_balance() {
        let ledger = MemoryCreditLedger::with_opening_balance(100);
        assert_eq!(ledger.balance("new").await.unwrap(), 100);
        assert!(ledger.debit("new", 40).await.unwrap());
        assert_eq!(ledger.credit("new", 5).await.unwrap(), 65);
    }
}
