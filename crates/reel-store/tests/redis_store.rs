//! Redis task store and ledger integration tests.

use std::sync::Arc;

use reel_models::{
    estimate_cost, segment, Priority, SegmentationStrategy, Task, TaskSpec, TaskStatus,
    TaskUpdate, TemplateRef, VoiceParams, VoiceRef,
};
use reel_store::{CreditLedger, RedisCreditLedger, RedisTaskStore, StoreConfig, TaskStore};

fn test_config() -> StoreConfig {
    dotenvy::dotenv().ok();
    StoreConfig {
        prefix: format!("reel-test:{}", uuid::Uuid::new_v4()),
        ..StoreConfig::from_env()
    }
}

fn sample_task(owner: &str) -> Task {
    let text = "Redis backed task. It has two sentences.";
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
#[ignore = "requires Redis"]
async fn test_task_roundtrip_and_transitions() {
    let store = RedisTaskStore::new(test_config()).expect("Failed to create store");
    store.ping().await.expect("Failed to ping Redis");

    let task = sample_task("redis-owner");
    store.create(&task).await.unwrap();
    assert!(store.create(&task).await.is_err());

    let loaded = store.get(task.id).await.unwrap().unwrap();
    assert_eq!(loaded, task);

    store.apply(task.id, TaskUpdate::Start).await.unwrap();
    let failed = store.apply(task.id, TaskUpdate::fail("boom")).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(store.apply(task.id, TaskUpdate::Start).await.is_err());

    let listed = store.list_by_owner("redis-owner").await.unwrap();
    assert_eq!(listed.len(), 1);

    assert!(store.delete(task.id).await.unwrap());
    assert!(store.get(task.id).await.unwrap().is_none());
    assert!(store.list_by_owner("redis-owner").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_concurrent_progress_updates_all_land() {
    let store = Arc::new(RedisTaskStore::new(test_config()).unwrap());
    let task = sample_task("racer");
    store.create(&task).await.unwrap();
    store.apply(task.id, TaskUpdate::Start).await.unwrap();

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .apply(task.id, TaskUpdate::Progress { pct: 20 + i * 10 })
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.get(task.id).await.unwrap().unwrap().progress_pct, 50);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_ledger_debit_and_refund_once() {
    let ledger = RedisCreditLedger::new(test_config()).unwrap();
    let owner = "ledger-owner";

    assert!(!ledger.debit(owner, 1).await.unwrap());
    ledger.credit(owner, 30).await.unwrap();
    assert!(ledger.debit(owner, 25).await.unwrap());
    assert_eq!(ledger.balance(owner).await.unwrap(), 5);

    assert!(ledger.refund(owner, 25, "refund:abc").await.unwrap());
    assert!(!ledger.refund(owner, 25, "refund:abc").await.unwrap());
    assert_eq!(ledger.balance(owner).await.unwrap(), 30);
}
