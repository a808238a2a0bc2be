//! End-to-end scenarios: upload -> dedup -> worker -> review -> push.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};

use docpipe_lib::blob::MemoryBlobStore;
use docpipe_lib::config::Settings;
use docpipe_lib::core_state::{Collaborators, CoreState};
use docpipe_lib::db::{self, Database};
use docpipe_lib::models::{ReasonKind, Task, TaskState};
use docpipe_lib::pipeline::ocr::{EngineRegistry, PlainTextOcr, TextPageSource};
use docpipe_lib::pipeline::review::ReviewDecision;
use docpipe_lib::pipeline::worker::WorkerPool;
use docpipe_lib::queue::SqliteQueue;
use docpipe_lib::rules::InMemoryRuleStore;
use docpipe_lib::signing::verify_signature;
use uuid::Uuid;

const INVOICE: &[u8] = b"ACME Corp\nInvoice No: INV-0042\x0cTotal: 1250.50\n";

type Received = Arc<Mutex<Vec<(HeaderMap, String)>>>;

async fn receive(State(rx): State<Received>, headers: HeaderMap, body: String) -> StatusCode {
    rx.lock().unwrap().push((headers, body));
    StatusCode::OK
}

async fn receiver() -> (String, Received) {
    let received: Received = Arc::default();
    let app = Router::new().route("/hook", post(receive)).with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), received)
}

struct Harness {
    core: CoreState,
    pool: Arc<WorkerPool>,
}

impl Harness {
    fn new(webhook_url: Option<&str>) -> Self {
        let db = Arc::new(Database::in_memory().unwrap());
        let rules = Arc::new(InMemoryRuleStore::new());
        let webhooks: Vec<&str> = webhook_url.map(|_| vec!["erp"]).unwrap_or_default();
        rules
            .publish(
                serde_json::from_value(json!({
                    "rule_id": "invoice", "version": 1,
                    "ocr": { "engine": "text" },
                    "schema": [
                        { "node": "field", "key": "number",
                          "strategy": { "type": "regex", "pattern": "INV-\\d+" } },
                        { "node": "field", "key": "total", "field_type": "number",
                          "strategy": { "type": "anchor", "anchor": "Total:", "max_chars": 12 } }
                    ],
                    "cleaning": [ { "field": "total", "ops": [ { "op": "coerce", "to": "number" } ] } ],
                    "validation": [
                        { "field": "number", "check": { "type": "required" } },
                        { "field": "total", "check": { "type": "range", "min": 0 } }
                    ],
                    "webhooks": webhooks
                }))
                .unwrap(),
            )
            .unwrap();
        if let Some(url) = webhook_url {
            rules
                .put_target(
                    serde_json::from_value(json!({ "id": "erp", "url": url, "secret": "shared" })).unwrap(),
                )
                .unwrap();
        }

        let core = CoreState::assemble(
            Settings {
                poll_ms: 10,
                ..Settings::default()
            },
            Collaborators {
                db: db.clone(),
                blobs: Arc::new(MemoryBlobStore::new()),
                rules,
                queue: Arc::new(SqliteQueue::new(db)),
                pages: Arc::new(TextPageSource),
                engines: EngineRegistry::new().with("text", Arc::new(PlainTextOcr)),
                llm: None,
            },
        )
        .unwrap();
        let pool = core.worker_pool();
        Self { core, pool }
    }

    async fn drain(&self) {
        while self.pool.run_once().await.unwrap() {}
    }

    fn task(&self, id: Uuid) -> Task {
        self.core.db.with(|conn| db::require_task(conn, &id)).unwrap()
    }
}

#[tokio::test]
async fn identical_upload_is_answered_instantly() {
    let h = Harness::new(None);
    let first = h.core.dedup.resolve(INVOICE, "a.txt", "invoice", 1).unwrap();
    assert!(!first.is_instant());
    h.drain().await;
    let a = h.task(first.task().id);
    assert_eq!(a.state, TaskState::Completed);

    let second = h.core.dedup.resolve(INVOICE, "a.txt", "invoice", 1).unwrap();
    let third = h.core.dedup.resolve(INVOICE, "a.txt", "invoice", 1).unwrap();

    for res in [&second, &third] {
        assert!(res.is_instant());
        assert_eq!(res.task().state, TaskState::Completed);
        assert_eq!(res.task().fields, a.fields);
        assert_eq!(res.task().result_json(), a.result_json());
    }
    assert_ne!(second.task().id, third.task().id);
    // Born Completed: no OCR or extraction phase in the timeline
    assert_eq!(second.task().timeline().len(), 1);
    // Nothing new was queued
    assert_eq!(h.core.queue.pending().unwrap(), 0);
    assert!(!h.pool.run_once().await.unwrap());
}

#[tokio::test]
async fn completed_task_is_pushed_with_signature() {
    let (url, received) = receiver().await;
    let h = Harness::new(Some(&url));
    let queued = h.core.dedup.resolve(INVOICE, "inv.txt", "invoice", 1).unwrap();
    h.drain().await;

    let task = h.task(queued.task().id);
    assert_eq!(task.state, TaskState::PushSuccess);
    let states: Vec<TaskState> = task.timeline().iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            TaskState::Queued,
            TaskState::Processing,
            TaskState::Completed,
            TaskState::Pushing,
            TaskState::PushSuccess
        ]
    );

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (headers, body) = &received[0];
    let signature = headers.get("x-signature-256").unwrap().to_str().unwrap();
    assert!(verify_signature("shared", body.as_bytes(), signature));
    let payload: Value = serde_json::from_str(body).unwrap();
    assert_eq!(payload["task_id"], json!(task.id.to_string()));
    assert_eq!(payload["result"]["number"], json!("INV-0042"));
    assert_eq!(payload["result"]["total"], json!(1250.5));

    let attempts = h.core.dispatcher.attempts(task.id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
}

#[tokio::test]
async fn missing_required_field_waits_for_review_then_pushes() {
    let (url, received) = receiver().await;
    let h = Harness::new(Some(&url));
    let queued = h
        .core
        .dedup
        .resolve(b"ACME Corp\nTotal: 99.00\n", "inv.txt", "invoice", 1)
        .unwrap();
    h.drain().await;

    let task = h.task(queued.task().id);
    assert_eq!(task.state, TaskState::PendingReview);
    assert_eq!(task.reason_fields(), vec!["number"]);
    assert_eq!(task.review_reasons.len(), 1);
    assert_eq!(task.review_reasons[0].kind, ReasonKind::MissingRequired);
    assert!(received.lock().unwrap().is_empty());

    let mut corrections = BTreeMap::new();
    corrections.insert("number".to_string(), json!("INV-0100"));
    let outcome = h
        .core
        .review
        .decide(task.id, ReviewDecision::Approve { corrections })
        .await
        .unwrap();
    assert_eq!(outcome.deliveries.len(), 1);
    assert!(outcome.deliveries[0].success);
    assert_eq!(outcome.task.state, TaskState::PushSuccess);

    let received = received.lock().unwrap();
    let payload: Value = serde_json::from_str(&received[0].1).unwrap();
    assert_eq!(payload["result"]["number"], json!("INV-0100"));
    assert_eq!(payload["metadata"]["corrected_fields"], json!(["number"]));
}

#[tokio::test]
async fn pending_review_result_is_not_reused() {
    let h = Harness::new(None);
    let body: &[u8] = b"Total: 5.00\n";
    let first = h.core.dedup.resolve(body, "a.txt", "invoice", 1).unwrap();
    h.drain().await;
    assert_eq!(h.task(first.task().id).state, TaskState::PendingReview);

    let second = h.core.dedup.resolve(body, "a.txt", "invoice", 1).unwrap();
    assert!(!second.is_instant());
    assert_eq!(second.task().state, TaskState::Queued);
}
