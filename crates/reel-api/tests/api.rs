//! HTTP tests against the router with in-memory collaborators.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use reel_api::{create_router, ApiConfig, AppState, OWNER_HEADER};
use reel_models::{TaskId, TaskOutputs, TaskStatus, TaskUpdate};
use reel_queue::{JobQueue, MemoryJobQueue};
use reel_storage::{keys, ArtifactStore, LocalArtifactStore};
use reel_store::{refund_key, CreditLedger, MemoryCreditLedger, MemoryTaskStore, TaskStore};

const OPENING_BALANCE: u64 = 50;

struct Harness {
    app: Router,
    store: Arc<MemoryTaskStore>,
    ledger: Arc<MemoryCreditLedger>,
    queue: Arc<MemoryJobQueue>,
    artifacts: Arc<LocalArtifactStore>,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new());
        let ledger = Arc::new(MemoryCreditLedger::with_opening_balance(OPENING_BALANCE));
        let queue = Arc::new(MemoryJobQueue::default());
        let artifacts = Arc::new(LocalArtifactStore::new(dir.path()).unwrap());

        let state = AppState::new(
            ApiConfig::default(),
            store.clone(),
            ledger.clone(),
            queue.clone(),
        )
        .with_artifacts(artifacts.clone());

        Self {
            app: create_router(state, None),
            store,
            ledger,
            queue,
            artifacts,
            _dir: dir,
        }
    }

    async fn send(&self, method: Method, uri: &str, owner: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn submit(&self, owner: &str) -> TaskId {
        let (status, body) = self
            .send(Method::POST, "/api/tasks", Some(owner), Some(task_body("Hello there.")))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().parse().unwrap()
    }

    async fn balance(&self, owner: &str) -> u64 {
        self.ledger.balance(owner).await.unwrap()
    }
}

fn task_body(text: &str) -> Value {
    json!({
        "text": text,
        "voice_id": "narrator",
        "template_id": "studio",
    })
}

#[tokio::test]
async fn test_health_sets_headers() {
    let h = Harness::new();
    let response = h
        .app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_ready_reports_checks() {
    let h = Harness::new();
    let (status, body) = h.send(Method::GET, "/ready", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["queue"]["status"], "ok");
}

#[tokio::test]
async fn test_missing_owner_is_unauthorized() {
    let h = Harness::new();
    let (status, body) = h.send(Method::GET, "/api/tasks", None, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_estimate_does_not_charge() {
    let h = Harness::new();
    let (status, body) = h
        .send(Method::POST, "/api/tasks/estimate", None, Some(task_body("Hello there.")))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cost"]["total"], 10);
    assert_eq!(body["needs_segmentation"], false);
    assert_eq!(h.balance("alice").await, OPENING_BALANCE);
}

#[tokio::test]
async fn test_submit_debits_and_enqueues() {
    let h = Harness::new();
    let id = h.submit("alice").await;

    assert_eq!(h.balance("alice").await, OPENING_BALANCE - 10);
    assert!(h.queue.get(id).await.unwrap().is_some());

    let (status, body) = h.send(Method::GET, &format!("/api/tasks/{id}"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    let (_, list) = h.send(Method::GET, "/api/tasks", Some("alice"), None).await;
    assert_eq!(list["count"], 1);

    let (_, other) = h.send(Method::GET, "/api/tasks", Some("bob"), None).await;
    assert_eq!(other["count"], 0);
}

#[tokio::test]
async fn test_submit_without_credits_is_rejected() {
    let h = Harness::new();
    h.ledger.set_balance("alice", 3).await;

    let (status, body) = h
        .send(Method::POST, "/api/tasks", Some("alice"), Some(task_body("Hello there.")))
        .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "insufficient_credits");
    assert_eq!(h.balance("alice").await, 3);
    assert!(h.store.list_by_owner("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_requests() {
    let h = Harness::new();

    let mut loud = task_body("Hello there.");
    loud["voice_params"] = json!({ "anger": 2.0 });
    let (status, body) = h.send(Method::POST, "/api/tasks", Some("alice"), Some(loud)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    let (status, _) = h
        .send(Method::POST, "/api/tasks", Some("alice"), Some(task_body("  ")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h.send(Method::GET, "/api/tasks/not-a-uuid", Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    assert_eq!(h.balance("alice").await, OPENING_BALANCE);
}

#[tokio::test]
async fn test_delete_pending_refunds_and_dequeues() {
    let h = Harness::new();
    let id = h.submit("alice").await;

    let (status, body) = h.send(Method::DELETE, &format!("/api/tasks/{id}"), Some("alice"), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["refunded_credits"], 10);
    assert_eq!(body["previous_status"], "pending");
    assert_eq!(h.balance("alice").await, OPENING_BALANCE);
    assert!(h.queue.get(id).await.unwrap().is_none());

    let (status, _) = h.send(Method::GET, &format!("/api/tasks/{id}"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_claimed_job_conflicts() {
    let h = Harness::new();
    let id = h.submit("alice").await;
    h.queue.dequeue("worker-1").await.unwrap().unwrap();

    // Claimed but not started yet
    let (status, _) = h.send(Method::DELETE, &format!("/api/tasks/{id}"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    h.store.apply(id, TaskUpdate::Start).await.unwrap();
    let (status, body) = h.send(Method::DELETE, &format!("/api/tasks/{id}"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
    assert_eq!(h.balance("alice").await, OPENING_BALANCE - 10);
}

#[tokio::test]
async fn test_delete_failed_task_refunds_once() {
    let h = Harness::new();
    let compensated = h.submit("alice").await;
    let unrefunded = h.submit("alice").await;

    for id in [compensated, unrefunded] {
        h.store.apply(id, TaskUpdate::Start).await.unwrap();
        h.store.apply(id, TaskUpdate::fail("video timed out")).await.unwrap();
    }
    h.ledger
        .refund("alice", 10, &refund_key(compensated))
        .await
        .unwrap();
    h.store.apply(compensated, TaskUpdate::MarkRefunded).await.unwrap();
    assert_eq!(h.balance("alice").await, OPENING_BALANCE - 10);

    let (_, body) = h
        .send(Method::DELETE, &format!("/api/tasks/{compensated}"), Some("alice"), None)
        .await;
    assert_eq!(body["refunded_credits"], 0);

    let (_, body) = h
        .send(Method::DELETE, &format!("/api/tasks/{unrefunded}"), Some("alice"), None)
        .await;
    assert_eq!(body["refunded_credits"], 10);
    assert_eq!(h.balance("alice").await, OPENING_BALANCE);
}

#[tokio::test]
async fn test_delete_completed_removes_artifacts_without_refund() {
    let h = Harness::new();
    let id = h.submit("alice").await;

    let stored = h
        .artifacts
        .put_bytes(&keys::final_video(id), b"mp4".to_vec(), "video/mp4")
        .await
        .unwrap();
    h.store.apply(id, TaskUpdate::Start).await.unwrap();
    h.store
        .apply(
            id,
            TaskUpdate::Complete(TaskOutputs {
                video_url: stored.url,
                ..TaskOutputs::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(h.store.get(id).await.unwrap().unwrap().status, TaskStatus::Completed);

    let (status, body) = h.send(Method::DELETE, &format!("/api/tasks/{id}"), Some("alice"), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["refunded_credits"], 0);
    assert_eq!(h.balance("alice").await, OPENING_BALANCE - 10);
    assert!(!h.artifacts.path_for(&keys::final_video(id)).unwrap().exists());
}

#[tokio::test]
async fn test_credits_endpoint() {
    let h = Harness::new();
    h.submit("alice").await;

    let (status, body) = h.send(Method::GET, "/api/credits", Some("alice"), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner_id"], "alice");
    assert_eq!(body["balance"], OPENING_BALANCE - 10);
}
