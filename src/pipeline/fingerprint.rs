//! Content + rule fingerprinting and instant reuse of finished results.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::processor::ProcessingError;
use crate::blob::{content_hash, BlobStore};
use crate::db::{self, Database};
use crate::models::{FileRef, Task, TaskState};
use crate::queue::{Job, JobQueue};
use crate::rules::RuleStore;

/// `sha256(sha256(bytes) | rule_id | version)`, hex. The same file under a
/// different rule or version never collides.
pub fn fingerprint(file_hash: &str, rule_id: &str, rule_version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_hash.as_bytes());
    hasher.update([0u8]);
    hasher.update(rule_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(rule_version.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// A prior Task with the same fingerprint had a final result; this new
    /// Task carries a copy of it and is already Completed.
    Instant(Task),
    /// A new Task was queued for processing.
    Queued(Task),
}

impl Resolution {
    pub fn task(&self) -> &Task {
        match self {
            Self::Instant(task) | Self::Queued(task) => task,
        }
    }

    pub fn is_instant(&self) -> bool {
        matches!(self, Self::Instant(_))
    }
}

pub struct DedupService {
    db: Arc<Database>,
    blobs: Arc<dyn BlobStore>,
    rules: Arc<dyn RuleStore>,
    queue: Arc<dyn JobQueue>,
}

impl DedupService {
    pub fn new(
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        rules: Arc<dyn RuleStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self { db, blobs, rules, queue }
    }

    /// Entry point for an upload. In-flight, failed and rejected Tasks with
    /// the same fingerprint are ignored: the upload proceeds on its own.
    pub fn resolve(
        &self,
        bytes: &[u8],
        file_name: &str,
        rule_id: &str,
        rule_version: u32,
    ) -> Result<Resolution, ProcessingError> {
        let rule = self.rules.get_config(rule_id, rule_version)?;
        let file_hash = content_hash(bytes);
        let fp = fingerprint(&file_hash, &rule.rule_id, rule.version);

        if let Some(prior) = self.db.with(|conn| db::find_reusable_task(conn, &fp))? {
            let task = reuse(&prior);
            self.db.with(|conn| db::insert_task(conn, &task))?;
            tracing::info!(
                task_id = %task.id,
                reused_from = %prior.id,
                fingerprint = %fp,
                "Instant result from prior task"
            );
            return Ok(Resolution::Instant(task));
        }

        let storage_ref = self.blobs.put(bytes)?;
        let task = Task::queued(
            FileRef {
                content_hash: file_hash,
                storage_ref,
                file_name: file_name.to_string(),
                size_bytes: bytes.len() as u64,
            },
            fp,
            rule_id,
            rule_version,
        );
        self.db.with(|conn| db::insert_task(conn, &task))?;
        self.queue.enqueue(&Job::Process { task_id: task.id })?;
        tracing::info!(task_id = %task.id, rule_id, rule_version, "Task queued");
        Ok(Resolution::Queued(task))
    }
}

/// New Task, born Completed, carrying the prior Task's result.
fn reuse(prior: &Task) -> Task {
    let mut task = Task::with_initial_state(
        prior.file.clone(),
        prior.fingerprint.clone(),
        &prior.rule_id,
        prior.rule_version,
        TaskState::Completed,
        Some(format!("Reused result of task {}", prior.id)),
    );
    task.instant = true;
    task.reused_from = Some(reused_root(prior));
    task.page_count = prior.page_count;
    task.merged_text = prior.merged_text.clone();
    task.pages = prior.pages.clone();
    task.fields = prior.fields.clone();
    task.warnings = prior.warnings.clone();
    task.corrections = prior.corrections.clone();
    task
}

/// Reuse chains point at the Task that actually did the work.
fn reused_root(prior: &Task) -> Uuid {
    prior.reused_from.unwrap_or(prior.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::models::{FieldResult, StrategyKind};
    use crate::pipeline::state;
    use crate::queue::SqliteQueue;
    use crate::rules::InMemoryRuleStore;
    use serde_json::json;

    struct Fixture {
        db: Arc<Database>,
        queue: Arc<SqliteQueue>,
        service: DedupService,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::new(db.clone()));
        let rules = Arc::new(InMemoryRuleStore::new());
        for version in [1, 2] {
            rules
                .publish(
                    serde_json::from_value(json!({
                        "rule_id": "invoice", "version": version,
                        "schema": [ { "node": "field", "key": "number",
                                      "strategy": { "type": "regex", "pattern": "INV-\\d+" } } ]
                    }))
                    .unwrap(),
                )
                .unwrap();
        }
        let service = DedupService::new(db.clone(), Arc::new(MemoryBlobStore::new()), rules, queue.clone());
        Fixture { db, queue, service }
    }

    fn finish(f: &Fixture, task: &Task) {
        let mut task = task.clone();
        state::transition(&mut task, TaskState::Processing, None).unwrap();
        task.fields.insert(
            "number".into(),
            FieldResult {
                value: json!("INV-7"),
                confidence: 97.0,
                source_page: Some(1),
                strategy: StrategyKind::Regex,
                row_pages: vec![],
                raw_value: None,
            },
        );
        state::transition(&mut task, TaskState::Completed, None).unwrap();
        f.db.with(|conn| db::update_task(conn, &task)).unwrap();
    }

    #[test]
    fn fingerprint_binds_rule_and_version() {
        let h = content_hash(b"bytes");
        assert_eq!(fingerprint(&h, "r", 1), fingerprint(&h, "r", 1));
        assert_ne!(fingerprint(&h, "r", 1), fingerprint(&h, "r", 2));
        assert_ne!(fingerprint(&h, "r", 1), fingerprint(&h, "s", 1));
        assert_eq!(fingerprint(&h, "r", 1).len(), 64);
    }

    #[test]
    fn miss_queues_new_task() {
        let f = fixture();
        let res = f.service.resolve(b"INV-7", "a.txt", "invoice", 1).unwrap();
        assert!(!res.is_instant());
        assert_eq!(res.task().state, TaskState::Queued);
        assert_eq!(f.queue.pending().unwrap(), 1);
    }

    #[test]
    fn in_flight_sibling_is_not_a_hit() {
        let f = fixture();
        let first = f.service.resolve(b"INV-7", "a.txt", "invoice", 1).unwrap();
        let second = f.service.resolve(b"INV-7", "a.txt", "invoice", 1).unwrap();
        assert!(!second.is_instant());
        assert_ne!(first.task().id, second.task().id);
        assert_eq!(f.queue.pending().unwrap(), 2);
    }

    #[test]
    fn completed_prior_is_reused_idempotently() {
        let f = fixture();
        let first = f.service.resolve(b"INV-7", "a.txt", "invoice", 1).unwrap();
        finish(&f, first.task());

        let a = f.service.resolve(b"INV-7", "b.txt", "invoice", 1).unwrap();
        let b = f.service.resolve(b"INV-7", "b.txt", "invoice", 1).unwrap();
        for res in [&a, &b] {
            let task = res.task();
            assert!(res.is_instant());
            assert!(task.instant);
            assert_eq!(task.state, TaskState::Completed);
            assert_eq!(task.transitions.len(), 1);
            assert_eq!(task.reused_from, Some(first.task().id));
            assert_eq!(task.fields["number"].value, json!("INV-7"));
        }
        // Only the original upload was ever queued
        assert_eq!(f.queue.pending().unwrap(), 1);
    }

    #[test]
    fn other_version_does_not_reuse() {
        let f = fixture();
        let first = f.service.resolve(b"INV-7", "a.txt", "invoice", 1).unwrap();
        finish(&f, first.task());
        assert!(!f.service.resolve(b"INV-7", "a.txt", "invoice", 2).unwrap().is_instant());
    }

    #[test]
    fn unknown_rule_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.service.resolve(b"x", "a.txt", "nope", 1),
            Err(ProcessingError::Rule(_))
        ));
    }
}
