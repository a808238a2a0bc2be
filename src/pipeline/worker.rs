//! Queue consumers. Each worker leases one job at a time: `Process` jobs run
//! a Task end-to-end and start delivery, `Deliver` jobs run one scheduled
//! push retry. A job is acked only after its handler finished, so a worker
//! that dies mid-job leaves it to be redelivered when the lease expires.
//! A job that keeps failing is dropped only after its Task was moved to
//! Failed or its deliveries dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::processor::{DocumentProcessor, ProcessingError};
use super::push::{PushDispatcher, PushError};
use crate::config::Settings;
use crate::models::TaskState;
use crate::queue::{Job, JobQueue, LeasedJob, QueueError};

/// Deliveries of one job before it is abandoned.
pub const MAX_DELIVERIES: u32 = 5;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug)]
enum JobError {
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error(transparent)]
    Push(#[from] PushError),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub workers: usize,
    /// Idle wait between empty polls.
    pub poll: Duration,
    /// Visibility timeout of a leased job.
    pub lease: Duration,
    /// Requeue delay after a failed handler, multiplied by the delivery count.
    pub retry_base: Duration,
}

impl WorkerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: settings.workers.max(1),
            poll: Duration::from_millis(settings.poll_ms),
            lease: Duration::from_secs(settings.lease_secs),
            retry_base: Duration::from_secs(5),
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<DocumentProcessor>,
    dispatcher: Arc<PushDispatcher>,
    options: WorkerOptions,
}

/// Running workers. Dropping the handle does not stop them; call `shutdown`.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal every worker and wait for in-progress jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<DocumentProcessor>,
        dispatcher: Arc<PushDispatcher>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            processor,
            dispatcher,
            options,
        }
    }

    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..self.options.workers)
            .map(|n| {
                let pool = self.clone();
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { pool.run(n, rx).await })
            })
            .collect();
        tracing::info!(workers = self.options.workers, "Worker pool started");
        WorkerHandle { shutdown_tx, workers }
    }

    async fn run(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker, "Worker started");
        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(worker, error = %e, "Queue unavailable"),
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                () = tokio::time::sleep(self.options.poll) => {}
            }
        }
        tracing::debug!(worker, "Worker stopped");
    }

    /// Lease and handle at most one job. `Ok(false)` when the queue was empty.
    pub async fn run_once(&self) -> Result<bool, WorkerError> {
        let Some(leased) = self.queue.lease(self.options.lease)? else {
            return Ok(false);
        };
        let LeasedJob { id, job, deliveries } = leased;

        match self.handle(&job).await {
            Ok(()) => self.queue.ack(&id)?,
            Err(JobError::Push(PushError::InFlight { task_id, target_id })) => {
                tracing::debug!(task_id = %task_id, target_id = %target_id, "Delivery busy; job requeued");
                self.queue.release(&id, self.options.poll)?;
            }
            Err(e) if deliveries >= MAX_DELIVERIES => {
                tracing::error!(job_id = %id, deliveries, error = %e, ?job, "Abandoning job after repeated failures");
                self.abandon(&job, &format!("gave up after {deliveries} deliveries: {e}"));
                self.queue.ack(&id)?;
            }
            Err(e) => {
                let delay = self.options.retry_base * deliveries;
                tracing::warn!(
                    job_id = %id,
                    deliveries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed; requeued"
                );
                self.queue.release(&id, delay)?;
            }
        }
        Ok(true)
    }

    /// Leave a durable trace of a dropped job on its Task.
    fn abandon(&self, job: &Job, reason: &str) {
        let result = match job {
            Job::Process { task_id } => match self.processor.abandon(*task_id, reason) {
                Ok(Some(_)) => Ok(()),
                Ok(None) => self.dispatcher.abandon(*task_id, None, reason).map_err(JobError::from),
                Err(e) => Err(e.into()),
            },
            Job::Deliver { task_id, target_id, .. } => self
                .dispatcher
                .abandon(*task_id, Some(target_id), reason)
                .map_err(JobError::from),
        };
        if let Err(e) = result {
            tracing::error!(?job, error = %e, "Could not record abandoned job");
        }
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::Process { task_id } => {
                let task = self.processor.process(*task_id).await?;
                // Pushing means an earlier run crashed between the two steps
                if matches!(task.state, TaskState::Completed | TaskState::Pushing) && !task.instant {
                    self.dispatcher.dispatch(task.id).await?;
                }
                Ok(())
            }
            Job::Deliver {
                task_id,
                target_id,
                attempt,
            } => {
                self.dispatcher.deliver(*task_id, target_id, *attempt).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, MemoryBlobStore};
    use crate::db::{self, Database};
    use crate::pipeline::extraction::ExtractionEngine;
    use crate::models::ErrorClass;
    use crate::pipeline::fingerprint::DedupService;
    use crate::pipeline::ocr::{EngineRegistry, OcrOrchestrator, PlainTextOcr, TextPageSource};
    use crate::pipeline::state;
    use crate::queue::SqliteQueue;
    use crate::rules::InMemoryRuleStore;
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        db: Arc<Database>,
        queue: Arc<SqliteQueue>,
        dedup: DedupService,
        pool: Arc<WorkerPool>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::new(db.clone()));
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let rules = Arc::new(InMemoryRuleStore::new());
        rules
            .publish(
                serde_json::from_value(json!({
                    "rule_id": "invoice", "version": 1,
                    "ocr": { "engine": "text" },
                    "schema": [ { "node": "field", "key": "number",
                                  "strategy": { "type": "regex", "pattern": "INV-\\d+" } } ]
                }))
                .unwrap(),
            )
            .unwrap();
        rules
            .publish(
                serde_json::from_value(json!({
                    "rule_id": "invoice", "version": 2,
                    "ocr": { "engine": "text" },
                    "schema": [ { "node": "field", "key": "number",
                                  "strategy": { "type": "regex", "pattern": "INV-\\d+" } } ],
                    "webhooks": ["erp"]
                }))
                .unwrap(),
            )
            .unwrap();
        let processor = DocumentProcessor::new(
            db.clone(),
            blobs.clone(),
            rules.clone(),
            Arc::new(TextPageSource),
            OcrOrchestrator::new(EngineRegistry::new().with("text", Arc::new(PlainTextOcr))),
            ExtractionEngine::ocr_only(),
        );
        let dispatcher =
            PushDispatcher::new(db.clone(), rules.clone(), queue.clone(), blobs.clone(), Duration::from_secs(60))
                .unwrap();
        let dedup = DedupService::new(db.clone(), blobs, rules, queue.clone());
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(processor),
            Arc::new(dispatcher),
            WorkerOptions {
                workers: 2,
                poll: Duration::from_millis(10),
                lease: Duration::from_secs(30),
                retry_base: Duration::ZERO,
            },
        ));
        Fixture { db, queue, dedup, pool }
    }

    #[tokio::test]
    async fn run_once_processes_and_acks() {
        let f = fixture();
        let queued = f.dedup.resolve(b"Invoice INV-12", "a.txt", "invoice", 1).unwrap();

        assert!(f.pool.run_once().await.unwrap());
        assert!(!f.pool.run_once().await.unwrap());
        assert_eq!(f.queue.pending().unwrap(), 0);

        let task = f.db.with(|conn| db::require_task(conn, &queued.task().id)).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    /// Simulates a storage fault: any write moving a Task to `state` aborts.
    fn refuse_state(db: &Database, state: TaskState) {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TRIGGER refuse_{s} BEFORE UPDATE ON tasks WHEN NEW.state = '{s}'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                s = state.as_str()
            ))?;
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn unknown_task_job_is_dropped_after_max_deliveries() {
        let f = fixture();
        f.queue.enqueue(&Job::Process { task_id: Uuid::new_v4() }).unwrap();

        for _ in 0..MAX_DELIVERIES {
            assert!(f.pool.run_once().await.unwrap());
        }
        assert_eq!(f.queue.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn abandoned_process_job_fails_its_task() {
        let f = fixture();
        let queued = f.dedup.resolve(b"Invoice INV-7", "a.txt", "invoice", 1).unwrap();
        refuse_state(&f.db, TaskState::Processing);

        for _ in 0..MAX_DELIVERIES {
            assert!(f.pool.run_once().await.unwrap());
        }
        assert_eq!(f.queue.pending().unwrap(), 0);

        let task = f.db.with(|conn| db::require_task(conn, &queued.task().id)).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        let failure = task.failure.unwrap();
        assert_eq!(failure.class, ErrorClass::TransientIo);
        assert!(failure.message.contains("5 deliveries"));
    }

    #[tokio::test]
    async fn abandoned_delivery_is_dead_lettered() {
        let f = fixture();
        let queued = f.dedup.resolve(b"Invoice INV-8", "a.txt", "invoice", 2).unwrap();
        let id = queued.task().id;
        f.db.with(|conn| {
            let mut task = db::require_task(conn, &id)?;
            for to in [TaskState::Processing, TaskState::Completed, TaskState::Pushing] {
                state::transition(&mut task, to, None)
                    .map_err(|e| db::DatabaseError::ConstraintViolation(e.to_string()))?;
            }
            db::update_task(conn, &task)?;
            conn.execute_batch(
                "CREATE TRIGGER refuse_attempts BEFORE INSERT ON push_attempts
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )?;
            Ok(())
        })
        .unwrap();
        // Only the delivery job is under test
        let process = f.queue.lease(Duration::from_secs(30)).unwrap().unwrap();
        f.queue.ack(&process.id).unwrap();
        f.queue
            .enqueue(&Job::Deliver { task_id: id, target_id: "erp".into(), attempt: 1 })
            .unwrap();

        for _ in 0..MAX_DELIVERIES {
            assert!(f.pool.run_once().await.unwrap());
        }
        assert_eq!(f.queue.pending().unwrap(), 0);

        let letters = f.db.with(db::list_dead_letters).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_id, id);
        assert_eq!(letters[0].target_id, "erp");
        let task = f.db.with(|conn| db::require_task(conn, &id)).unwrap();
        assert_eq!(task.state, TaskState::PushFailed);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_shuts_down() {
        let f = fixture();
        let ids: Vec<Uuid> = (0..4)
            .map(|i| {
                let body = format!("Invoice INV-{i}");
                f.dedup
                    .resolve(body.as_bytes(), "a.txt", "invoice", 1)
                    .unwrap()
                    .task()
                    .id
            })
            .collect();

        let handle = f.pool.clone().start();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while f.queue.pending().unwrap() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;

        for id in ids {
            let task = f.db.with(|conn| db::require_task(conn, &id)).unwrap();
            assert_eq!(task.state, TaskState::Completed);
        }
    }
}
