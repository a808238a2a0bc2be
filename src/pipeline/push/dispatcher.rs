//! Delivers finished results to every webhook target bound to the rule.
//!
//! Targets are independent: each one is sent concurrently, retried on its
//! own schedule through delayed `Deliver` jobs, and dead-lettered on its
//! own. A (task, target) pair never has two attempts in flight at once.
//! Every attempt, successful or not, is appended to `push_attempts`.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use futures_util::future::join_all;
use uuid::Uuid;

use super::template::{render, BodyFormat, TemplateContext};
use super::{DeliveryOutcome, PushError, BACKOFF_SECS, MAX_ATTEMPTS};
use crate::blob::BlobStore;
use crate::db::{self, Database};
use crate::models::{
    AuthScheme, DeadLetter, PushAttempt, RequestCapture, ResponseCapture, Task, TaskState, WebhookTarget,
};
use crate::pipeline::state;
use crate::queue::{Job, JobQueue};
use crate::rules::RuleStore;
use crate::signing::sign_body;

/// Response bodies are captured up to this many characters.
const MAX_CAPTURED_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Part of the automatic 3-attempt schedule.
    Scheduled,
    /// Operator redelivery of a dead letter: one try, no rescheduling.
    Manual,
}

/// Removes the (task, target) claim when the attempt ends, however it ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<(Uuid, String)>>,
    key: (Uuid, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

struct PreparedRequest {
    method: reqwest::Method,
    url: String,
    headers: BTreeMap<String, String>,
    body: String,
    timeout: Duration,
}

impl PreparedRequest {
    /// Capture with auth material masked.
    fn capture(&self, auth_header: Option<&str>) -> RequestCapture {
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| {
                let masked = auth_header.is_some_and(|h| h.eq_ignore_ascii_case(k));
                (k.clone(), if masked { "***".to_string() } else { v.clone() })
            })
            .collect();
        RequestCapture {
            method: self.method.to_string(),
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}

pub struct PushDispatcher {
    db: Arc<Database>,
    rules: Arc<dyn RuleStore>,
    queue: Arc<dyn JobQueue>,
    blobs: Arc<dyn BlobStore>,
    client: reqwest::Client,
    in_flight: Mutex<HashSet<(Uuid, String)>>,
    presign_ttl: Duration,
    backoff: [Duration; MAX_ATTEMPTS as usize],
}

impl PushDispatcher {
    pub fn new(
        db: Arc<Database>,
        rules: Arc<dyn RuleStore>,
        queue: Arc<dyn JobQueue>,
        blobs: Arc<dyn BlobStore>,
        presign_ttl: Duration,
    ) -> Result<Self, PushError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            db,
            rules,
            queue,
            blobs,
            client,
            in_flight: Mutex::new(HashSet::new()),
            presign_ttl,
            backoff: BACKOFF_SECS.map(Duration::from_secs),
        })
    }

    /// Override the retry schedule (tests and local runs).
    pub fn with_backoff(mut self, backoff: [Duration; MAX_ATTEMPTS as usize]) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start delivery of a Completed task: Completed -> Pushing, then the
    /// first attempt to every bound target, concurrently.
    ///
    /// A task already in Pushing (a redelivered job after a crash) resumes
    /// with the targets that have no recorded attempt yet. A rule without
    /// targets leaves the task in Completed.
    pub async fn dispatch(&self, task_id: Uuid) -> Result<Vec<DeliveryOutcome>, PushError> {
        let task = self.db.with(|conn| db::require_task(conn, &task_id))?;
        let rule = self.rules.get_config(&task.rule_id, task.rule_version)?;
        if rule.webhooks.is_empty() {
            tracing::info!(task_id = %task_id, "No webhook targets bound; delivery skipped");
            return Ok(Vec::new());
        }

        let (task, targets) = match task.state {
            TaskState::Completed => {
                let task = self.db.with(|conn| {
                    let mut task = db::require_task(conn, &task_id)?;
                    state::transition(&mut task, TaskState::Pushing, None)
                        .map_err(|e| db::DatabaseError::ConstraintViolation(e.to_string()))?;
                    db::update_task(conn, &task)?;
                    Ok(task)
                })?;
                (task, rule.webhooks.clone())
            }
            TaskState::Pushing => {
                let mut pending = Vec::new();
                for target_id in &rule.webhooks {
                    let next = self
                        .db
                        .with(|conn| db::next_attempt_number(conn, &task_id, target_id))?;
                    if next == 1 {
                        pending.push(target_id.clone());
                    }
                }
                (task, pending)
            }
            other => return Err(PushError::NotDeliverable { task_id, state: other }),
        };

        tracing::info!(task_id = %task_id, targets = targets.len(), "Dispatching result");
        let results = join_all(
            targets
                .iter()
                .map(|target_id| self.attempt(&task, target_id, 1, Mode::Scheduled)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(PushError::InFlight { target_id, .. }) => {
                    tracing::debug!(task_id = %task_id, target_id = %target_id, "Attempt already in flight");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Run a scheduled retry. Returns `None` when the attempt was already
    /// recorded (a redelivered job) or the task is no longer pushing.
    pub async fn deliver(
        &self,
        task_id: Uuid,
        target_id: &str,
        attempt: u32,
    ) -> Result<Option<DeliveryOutcome>, PushError> {
        let (task, next) = self.db.with(|conn| {
            Ok((
                db::require_task(conn, &task_id)?,
                db::next_attempt_number(conn, &task_id, target_id)?,
            ))
        })?;
        if task.state != TaskState::Pushing || attempt != next {
            tracing::debug!(
                task_id = %task_id,
                target_id,
                attempt,
                expected = next,
                state = %task.state,
                "Skipping stale delivery job"
            );
            return Ok(None);
        }
        self.attempt(&task, target_id, attempt, Mode::Scheduled).await.map(Some)
    }

    /// Dead-letter targets whose delivery job kept failing before an attempt
    /// could be recorded, then settle the task. `target_id` narrows it to one
    /// target; targets that already received the result are left alone.
    pub fn abandon(&self, task_id: Uuid, target_id: Option<&str>, reason: &str) -> Result<(), PushError> {
        let Some(task) = self.db.with(|conn| db::get_task(conn, &task_id))? else {
            return Ok(());
        };
        if task.instant || !matches!(task.state, TaskState::Completed | TaskState::Pushing) {
            return Ok(());
        }
        let rule = self.rules.get_config(&task.rule_id, task.rule_version)?;
        let targets: Vec<&String> = rule
            .webhooks
            .iter()
            .filter(|t| target_id.map_or(true, |id| id == t.as_str()))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        self.db.with(|conn| {
            let mut task = db::require_task(conn, &task_id)?;
            if task.state == TaskState::Completed {
                state::transition(&mut task, TaskState::Pushing, None)
                    .map_err(|e| db::DatabaseError::ConstraintViolation(e.to_string()))?;
                db::update_task(conn, &task)?;
            }
            for target in &targets {
                let attempts = db::list_target_attempts(conn, &task_id, target)?;
                if attempts.iter().any(|a| a.success) {
                    continue;
                }
                tracing::error!(task_id = %task_id, target_id = %target, reason, "Delivery abandoned; dead-lettered");
                db::upsert_dead_letter(
                    conn,
                    &DeadLetter {
                        id: Uuid::new_v4(),
                        task_id,
                        target_id: target.to_string(),
                        attempts: attempts.len() as u32,
                        last_error: reason.to_string(),
                        created_at: Utc::now(),
                    },
                )?;
            }
            Ok(())
        })?;
        self.settle(task_id)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, PushError> {
        Ok(self.db.with(db::list_dead_letters)?)
    }

    pub fn attempts(&self, task_id: Uuid) -> Result<Vec<PushAttempt>, PushError> {
        Ok(self.db.with(|conn| db::list_push_attempts(conn, &task_id))?)
    }

    /// One fresh delivery of a dead-lettered pair, using the target
    /// configuration as it is now. Success removes the entry and moves a
    /// PushFailed task to PushSuccess; failure refreshes the entry.
    pub async fn retry_dead_letter(&self, id: Uuid) -> Result<DeliveryOutcome, PushError> {
        let letter = self
            .db
            .with(|conn| db::get_dead_letter(conn, &id))?
            .ok_or(PushError::DeadLetterNotFound(id))?;
        let (task, attempt) = self.db.with(|conn| {
            Ok((
                db::require_task(conn, &letter.task_id)?,
                db::next_attempt_number(conn, &letter.task_id, &letter.target_id)?,
            ))
        })?;
        tracing::info!(
            task_id = %task.id,
            target_id = %letter.target_id,
            attempt,
            "Manual redelivery of dead letter"
        );
        self.attempt(&task, &letter.target_id, attempt, Mode::Manual).await
    }

    // -----------------------------------------------------------------------
    // One attempt
    // -----------------------------------------------------------------------

    fn claim(&self, task_id: Uuid, target_id: &str) -> Result<InFlightGuard<'_>, PushError> {
        let key = (task_id, target_id.to_string());
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| PushError::Database(db::DatabaseError::LockPoisoned))?;
        if !set.insert(key.clone()) {
            return Err(PushError::InFlight {
                task_id,
                target_id: target_id.to_string(),
            });
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            key,
        })
    }

    async fn attempt(
        &self,
        task: &Task,
        target_id: &str,
        attempt: u32,
        mode: Mode,
    ) -> Result<DeliveryOutcome, PushError> {
        let _guard = self.claim(task.id, target_id)?;
        let started = Instant::now();

        let (capture, sent) = match self.rules.get_target(target_id) {
            Ok(target) => match self.prepare(task, &target) {
                Ok(request) => {
                    let capture = request.capture(auth_header_name(&target.auth));
                    (capture, self.send(request).await)
                }
                Err(e) => (empty_capture(&target.url), Err(e.to_string())),
            },
            Err(e) => (empty_capture(""), Err(e.to_string())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, status_code, response, error) = match sent {
            Ok(response) => {
                let ok = (200..300).contains(&response.status);
                let error = (!ok).then(|| format!("HTTP {}", response.status));
                (ok, Some(response.status), Some(response), error)
            }
            Err(e) => (false, None, None, Some(e)),
        };

        let retry_delay = (!success && mode == Mode::Scheduled)
            .then(|| self.backoff[(attempt.clamp(1, MAX_ATTEMPTS) - 1) as usize]);
        let schedules_retry = retry_delay.is_some() && attempt < MAX_ATTEMPTS;
        let dead_letters = !success && !schedules_retry;

        let record = PushAttempt {
            id: Uuid::new_v4(),
            task_id: task.id,
            target_id: target_id.to_string(),
            attempt,
            success,
            status_code,
            error: error.clone(),
            duration_ms,
            request: capture,
            response,
            retry_delay_secs: retry_delay.map(|d| d.as_secs()),
            attempted_at: Utc::now(),
        };

        if success {
            tracing::info!(task_id = %task.id, target_id, attempt, status = ?status_code, duration_ms, "Push delivered");
        } else if schedules_retry {
            tracing::warn!(
                task_id = %task.id,
                target_id,
                attempt,
                error = ?error,
                retry_in_secs = retry_delay.map(|d| d.as_secs()),
                "Push failed; retry scheduled"
            );
        } else {
            tracing::error!(task_id = %task.id, target_id, attempt, error = ?error, "Push failed; dead-lettered");
        }

        self.db.with(|conn| {
            db::insert_push_attempt(conn, &record)?;
            if dead_letters {
                db::upsert_dead_letter(
                    conn,
                    &DeadLetter {
                        id: Uuid::new_v4(),
                        task_id: task.id,
                        target_id: target_id.to_string(),
                        attempts: attempt,
                        last_error: error.clone().unwrap_or_default(),
                        created_at: Utc::now(),
                    },
                )?;
            }
            Ok(())
        })?;

        if schedules_retry {
            if let Some(delay) = retry_delay {
                self.queue.enqueue_delayed(
                    &Job::Deliver {
                        task_id: task.id,
                        target_id: target_id.to_string(),
                        attempt: attempt + 1,
                    },
                    delay,
                )?;
            }
        }

        match mode {
            Mode::Scheduled if !schedules_retry => self.settle(task.id)?,
            Mode::Manual if success => self.settle_redelivery(task.id, target_id)?,
            _ => {}
        }

        Ok(DeliveryOutcome {
            target_id: target_id.to_string(),
            attempt,
            success,
            status_code,
            error,
            next_retry: retry_delay.filter(|_| schedules_retry),
            dead_lettered: dead_letters,
        })
    }

    fn prepare(&self, task: &Task, target: &WebhookTarget) -> Result<PreparedRequest, PushError> {
        let invalid = |reason: String| PushError::InvalidTarget {
            target_id: target.id.clone(),
            reason,
        };
        let method = reqwest::Method::from_bytes(target.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid(format!("unsupported method '{}'", target.method)))?;
        if target.secret.is_empty() {
            return Err(invalid("signing secret is empty".into()));
        }

        let file_url = self
            .blobs
            .presign(&task.file.storage_ref, self.presign_ttl)?;
        let mut headers = target.headers.clone();
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("Content-Type".into(), "application/json".into());
        }
        let format = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map_or(BodyFormat::Json, |(_, v)| BodyFormat::from_content_type(v));

        let ctx = TemplateContext::for_task(task, &file_url);
        let body = match &target.body_template {
            Some(template) => render(template, &ctx, format)?,
            None => ctx.envelope(),
        };
        headers.insert(target.signature_header.clone(), sign_body(&target.secret, body.as_bytes())?);
        headers.insert("X-Docpipe-Task".into(), task.id.to_string());
        match &target.auth {
            AuthScheme::None => {}
            AuthScheme::Bearer { token } => {
                headers.insert("Authorization".into(), format!("Bearer {token}"));
            }
            AuthScheme::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
                headers.insert("Authorization".into(), format!("Basic {encoded}"));
            }
            AuthScheme::Header { name, value } => {
                headers.insert(name.clone(), value.clone());
            }
        }

        Ok(PreparedRequest {
            method,
            url: target.url.clone(),
            headers,
            body,
            timeout: Duration::from_secs(target.timeout_secs.max(1)),
        })
    }

    async fn send(&self, request: PreparedRequest) -> Result<ResponseCapture, String> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await.map_err(|e| describe_transport(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = response.text().await.unwrap_or_default();
        let body = match body.char_indices().nth(MAX_CAPTURED_BODY) {
            Some((cut, _)) => body[..cut].to_string(),
            None => body,
        };
        Ok(ResponseCapture { status, headers, body })
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Once no target has a retry pending, Pushing becomes PushSuccess when
    /// at least one target received the result, PushFailed when all failed.
    fn settle(&self, task_id: Uuid) -> Result<(), PushError> {
        let rule = {
            let task = self.db.with(|conn| db::require_task(conn, &task_id))?;
            self.rules.get_config(&task.rule_id, task.rule_version)?
        };
        self.db.with(|conn| {
            let mut task = db::require_task(conn, &task_id)?;
            if task.state != TaskState::Pushing {
                return Ok(());
            }
            let letters = db::list_dead_letters(conn)?;
            let mut delivered = 0;
            let mut dead = Vec::new();
            for target_id in &rule.webhooks {
                let attempts = db::list_target_attempts(conn, &task_id, target_id)?;
                let lettered = letters
                    .iter()
                    .any(|l| l.task_id == task_id && &l.target_id == target_id);
                if attempts.iter().any(|a| a.success) {
                    delivered += 1;
                } else if lettered || attempts.iter().any(|a| a.attempt >= MAX_ATTEMPTS) {
                    dead.push(target_id.clone());
                } else {
                    return Ok(());
                }
            }

            for target_id in &dead {
                task.warnings.push(format!("Delivery to '{target_id}' dead-lettered"));
            }
            let (to, note) = if delivered > 0 {
                (TaskState::PushSuccess, format!("{delivered} of {} targets delivered", rule.webhooks.len()))
            } else {
                (TaskState::PushFailed, "All targets failed".to_string())
            };
            state::transition(&mut task, to, Some(note))
                .map_err(|e| db::DatabaseError::ConstraintViolation(e.to_string()))?;
            db::update_task(conn, &task)
        })?;
        Ok(())
    }

    fn settle_redelivery(&self, task_id: Uuid, target_id: &str) -> Result<(), PushError> {
        self.db.with(|conn| {
            let letters = db::list_dead_letters(conn)?;
            if let Some(letter) = letters
                .iter()
                .find(|l| l.task_id == task_id && l.target_id == target_id)
            {
                db::delete_dead_letter(conn, &letter.id)?;
            }
            let mut task = db::require_task(conn, &task_id)?;
            if task.state == TaskState::PushFailed {
                state::transition(
                    &mut task,
                    TaskState::PushSuccess,
                    Some(format!("Manual redelivery to '{target_id}'")),
                )
                .map_err(|e| db::DatabaseError::ConstraintViolation(e.to_string()))?;
                db::update_task(conn, &task)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn auth_header_name(auth: &AuthScheme) -> Option<&str> {
    match auth {
        AuthScheme::None => None,
        AuthScheme::Bearer { .. } | AuthScheme::Basic { .. } => Some("Authorization"),
        AuthScheme::Header { name, .. } => Some(name),
    }
}

fn empty_capture(url: &str) -> RequestCapture {
    RequestCapture {
        method: String::new(),
        url: url.to_string(),
        headers: BTreeMap::new(),
        body: String::new(),
    }
}

fn describe_transport(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::models::FileRef;
    use crate::queue::SqliteQueue;
    use crate::rules::InMemoryRuleStore;
    use crate::signing::verify_signature;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Receiver that fails the first `fail_first` requests with 500.
    #[derive(Clone, Default)]
    struct Receiver {
        fail_first: usize,
        hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<(HeaderMap, String)>>>,
    }

    async fn receive(State(rx): State<Receiver>, headers: HeaderMap, body: String) -> StatusCode {
        let n = rx.hits.fetch_add(1, Ordering::SeqCst);
        rx.bodies.lock().unwrap().push((headers, body));
        if n < rx.fail_first {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    async fn serve(rx: Receiver) -> String {
        let app = Router::new().route("/hook", post(receive)).with_state(rx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    struct Fixture {
        db: Arc<Database>,
        queue: Arc<SqliteQueue>,
        rules: Arc<InMemoryRuleStore>,
        dispatcher: PushDispatcher,
        task_id: Uuid,
    }

    fn target(id: &str, url: &str) -> WebhookTarget {
        serde_json::from_value(json!({
            "id": id, "url": url, "secret": "s3cret",
            "auth": { "type": "bearer", "token": "tok" }
        }))
        .unwrap()
    }

    fn fixture(targets: &[(&str, &str)]) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::new(db.clone()));
        let rules = Arc::new(InMemoryRuleStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let ids: Vec<&str> = targets.iter().map(|(id, _)| *id).collect();
        rules
            .publish(
                serde_json::from_value(json!({
                    "rule_id": "invoice", "version": 1,
                    "schema": [ { "node": "field", "key": "number",
                                  "strategy": { "type": "regex", "pattern": "INV-\\d+" } } ],
                    "webhooks": ids
                }))
                .unwrap(),
            )
            .unwrap();
        for (id, url) in targets {
            rules.put_target(target(id, url)).unwrap();
        }

        let storage_ref = blobs.put(b"INV-1").unwrap();
        let mut task = Task::queued(
            FileRef {
                content_hash: storage_ref.clone(),
                storage_ref,
                file_name: "inv.txt".into(),
                size_bytes: 5,
            },
            "fp".into(),
            "invoice",
            1,
        );
        state::transition(&mut task, TaskState::Processing, None).unwrap();
        state::transition(&mut task, TaskState::Completed, None).unwrap();
        db.with(|conn| db::insert_task(conn, &task)).unwrap();

        let dispatcher = PushDispatcher::new(
            db.clone(),
            rules.clone(),
            queue.clone(),
            blobs,
            Duration::from_secs(60),
        )
        .unwrap();
        Fixture {
            db,
            queue,
            rules,
            dispatcher,
            task_id: task.id,
        }
    }

    fn state_of(f: &Fixture) -> TaskState {
        f.db.with(|conn| db::require_task(conn, &f.task_id)).unwrap().state
    }

    #[tokio::test]
    async fn signed_delivery_succeeds() {
        let rx = Receiver::default();
        let url = serve(rx.clone()).await;
        let f = fixture(&[("erp", &url)]);

        let outcomes = f.dispatcher.dispatch(f.task_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(state_of(&f), TaskState::PushSuccess);

        let (headers, body) = rx.bodies.lock().unwrap()[0].clone();
        let signature = headers["x-signature-256"].to_str().unwrap();
        assert!(verify_signature("s3cret", body.as_bytes(), signature));
        assert_eq!(headers["authorization"], "Bearer tok");

        let attempts = f.dispatcher.attempts(f.task_id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].request.headers["Authorization"], "***");
        assert_eq!(attempts[0].response.as_ref().unwrap().status, 200);
    }

    #[tokio::test]
    async fn three_failures_dead_letter_with_backoff() {
        let rx = Receiver {
            fail_first: usize::MAX,
            ..Default::default()
        };
        let url = serve(rx.clone()).await;
        let f = fixture(&[("erp", &url)]);

        let first = f.dispatcher.dispatch(f.task_id).await.unwrap();
        assert_eq!(first[0].next_retry, Some(Duration::from_secs(10)));
        let second = f.dispatcher.deliver(f.task_id, "erp", 2).await.unwrap().unwrap();
        assert_eq!(second.next_retry, Some(Duration::from_secs(30)));
        let third = f.dispatcher.deliver(f.task_id, "erp", 3).await.unwrap().unwrap();
        assert!(third.dead_lettered);
        assert_eq!(third.next_retry, None);

        let attempts = f.dispatcher.attempts(f.task_id).unwrap();
        let delays: Vec<Option<u64>> = attempts.iter().map(|a| a.retry_delay_secs).collect();
        assert_eq!(delays, vec![Some(10), Some(30), Some(90)]);
        assert!(attempts.iter().all(|a| a.status_code == Some(500)));

        let letters = f.dispatcher.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(state_of(&f), TaskState::PushFailed);
        // Two retries were scheduled, nothing after the dead letter
        assert_eq!(f.queue.pending().unwrap(), 2);
    }

    #[tokio::test]
    async fn success_on_second_attempt() {
        let rx = Receiver {
            fail_first: 1,
            ..Default::default()
        };
        let url = serve(rx.clone()).await;
        let f = fixture(&[("erp", &url)]);

        f.dispatcher.dispatch(f.task_id).await.unwrap();
        assert_eq!(state_of(&f), TaskState::Pushing);
        let second = f.dispatcher.deliver(f.task_id, "erp", 2).await.unwrap().unwrap();
        assert!(second.success);

        assert_eq!(f.dispatcher.attempts(f.task_id).unwrap().len(), 2);
        assert!(f.dispatcher.dead_letters().unwrap().is_empty());
        assert_eq!(state_of(&f), TaskState::PushSuccess);
        // A redelivered copy of the same job is a no-op
        assert!(f.dispatcher.deliver(f.task_id, "erp", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_failing_target_does_not_affect_another() {
        let ok = Receiver::default();
        let ok_url = serve(ok.clone()).await;
        let f = fixture(&[("good", &ok_url), ("bad", "http://127.0.0.1:9/hook")]);

        let outcomes = f.dispatcher.dispatch(f.task_id).await.unwrap();
        let good = outcomes.iter().find(|o| o.target_id == "good").unwrap();
        let bad = outcomes.iter().find(|o| o.target_id == "bad").unwrap();
        assert!(good.success);
        assert!(!bad.success);
        assert!(bad.status_code.is_none());
        assert_eq!(ok.hits.load(Ordering::SeqCst), 1);
        // Bad target still has retries pending
        assert_eq!(state_of(&f), TaskState::Pushing);
    }

    #[tokio::test]
    async fn dead_letter_retry_uses_current_target() {
        let f = fixture(&[("erp", "http://127.0.0.1:9/hook")]);
        f.dispatcher.dispatch(f.task_id).await.unwrap();
        f.dispatcher.deliver(f.task_id, "erp", 2).await.unwrap();
        f.dispatcher.deliver(f.task_id, "erp", 3).await.unwrap();
        assert_eq!(state_of(&f), TaskState::PushFailed);

        // Operator fixes the URL, then retries
        let rx = Receiver::default();
        let url = serve(rx.clone()).await;
        f.rules.put_target(target("erp", &url)).unwrap();
        let letter = f.dispatcher.dead_letters().unwrap().remove(0);
        let outcome = f.dispatcher.retry_dead_letter(letter.id).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempt, 4);
        assert!(f.dispatcher.dead_letters().unwrap().is_empty());
        assert_eq!(state_of(&f), TaskState::PushSuccess);
        assert_eq!(rx.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_attempts_for_one_target_are_refused() {
        let f = fixture(&[("erp", "http://127.0.0.1:9/hook")]);
        let _held = f.dispatcher.claim(f.task_id, "erp").unwrap();
        assert!(matches!(
            f.dispatcher.claim(f.task_id, "erp"),
            Err(PushError::InFlight { .. })
        ));
        assert!(f.dispatcher.claim(f.task_id, "other").is_ok());
    }
}
