//! Durable at-least-once job queue with delayed delivery.
//!
//! A leased job is invisible until its lease deadline; a worker that dies
//! mid-job never acks, so the job becomes leasable again once the deadline
//! passes. Delivery retries use `enqueue_delayed` instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{format_ts, Database, DatabaseError};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Run the pipeline for a Queued task.
    Process { task_id: Uuid },
    /// One delivery attempt of a task's result to one target.
    Deliver {
        task_id: Uuid,
        target_id: String,
        attempt: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub id: String,
    pub job: Job,
    /// How many times this job has been handed out, this lease included.
    pub deliveries: u32,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: &Job) -> Result<String, QueueError> {
        self.enqueue_delayed(job, Duration::ZERO)
    }

    fn enqueue_delayed(&self, job: &Job, delay: Duration) -> Result<String, QueueError>;

    /// Next available job, hidden from other consumers for `lease_for`.
    fn lease(&self, lease_for: Duration) -> Result<Option<LeasedJob>, QueueError>;

    fn ack(&self, id: &str) -> Result<(), QueueError>;

    /// Give a leased job back, visible again after `delay`.
    fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError>;

    /// Jobs not yet acked, leased or not.
    fn pending(&self) -> Result<usize, QueueError>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Queue backed by the `jobs` table.
pub struct SqliteQueue {
    db: Arc<Database>,
}

impl SqliteQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl JobQueue for SqliteQueue {
    fn enqueue_delayed(&self, job: &Job, delay: Duration) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(job)?;
        let available_at = now_ms().saturating_add(millis(delay));
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, payload, available_at, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, payload, available_at, format_ts(&Utc::now())],
            )?;
            Ok(())
        })?;
        tracing::debug!(job_id = %id, delay_ms = millis(delay), "Job enqueued");
        Ok(id)
    }

    fn lease(&self, lease_for: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let conn = self.db.lock()?;
        loop {
            let now = now_ms();
            let tx = conn.unchecked_transaction()?;
            let next: Option<(String, String, u32)> = tx
                .query_row(
                    "SELECT id, payload, deliveries FROM jobs
                     WHERE available_at <= ?1 AND (leased_until IS NULL OR leased_until <= ?1)
                     ORDER BY available_at, created_at LIMIT 1",
                    params![now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((id, payload, deliveries)) = next else {
                return Ok(None);
            };

            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => {
                    tx.execute(
                        "UPDATE jobs SET leased_until = ?1, deliveries = deliveries + 1 WHERE id = ?2",
                        params![now.saturating_add(millis(lease_for)), id],
                    )?;
                    tx.commit()?;
                    return Ok(Some(LeasedJob {
                        id,
                        job,
                        deliveries: deliveries + 1,
                    }));
                }
                Err(e) => {
                    // Unreadable payloads can never succeed; drop them and keep going
                    tracing::error!(job_id = %id, error = %e, "Discarding malformed job");
                    tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                    tx.commit()?;
                }
            }
        }
    }

    fn ack(&self, id: &str) -> Result<(), QueueError> {
        self.db.with(|conn| {
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(())
        })?;
        Ok(())
    }

    fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError> {
        let available_at = now_ms().saturating_add(millis(delay));
        self.db.with(|conn| {
            conn.execute(
                "UPDATE jobs SET leased_until = NULL, available_at = ?1 WHERE id = ?2",
                params![available_at, id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn pending(&self) -> Result<usize, QueueError> {
        let count = self.db.with(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get::<_, i64>(0))?)
        })?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> SqliteQueue {
        SqliteQueue::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn process() -> Job {
        Job::Process { task_id: Uuid::new_v4() }
    }

    #[test]
    fn job_payload_is_tagged() {
        let job = Job::Deliver {
            task_id: Uuid::nil(),
            target_id: "erp".into(),
            attempt: 2,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "deliver");
        assert_eq!(json["attempt"], 2);
    }

    #[test]
    fn lease_then_ack_removes_job() {
        let q = queue();
        let job = process();
        q.enqueue(&job).unwrap();

        let leased = q.lease(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(leased.job, job);
        assert_eq!(leased.deliveries, 1);
        assert!(q.lease(Duration::from_secs(60)).unwrap().is_none());

        q.ack(&leased.id).unwrap();
        assert_eq!(q.pending().unwrap(), 0);
    }

    #[test]
    fn delayed_job_is_invisible_until_due() {
        let q = queue();
        q.enqueue_delayed(&process(), Duration::from_secs(3600)).unwrap();
        assert!(q.lease(Duration::from_secs(60)).unwrap().is_none());
        assert_eq!(q.pending().unwrap(), 1);
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let q = queue();
        let job = process();
        q.enqueue(&job).unwrap();

        // Worker "crashes": lease expires without an ack
        let first = q.lease(Duration::ZERO).unwrap().unwrap();
        let second = q.lease(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.job, job);
        assert_eq!(second.deliveries, 2);
    }

    #[test]
    fn release_makes_job_available_again() {
        let q = queue();
        q.enqueue(&process()).unwrap();
        let leased = q.lease(Duration::from_secs(60)).unwrap().unwrap();
        q.release(&leased.id, Duration::ZERO).unwrap();
        assert!(q.lease(Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn malformed_payload_is_discarded() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.with(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, payload, available_at, created_at) VALUES ('bad', 'nope', 0, 'x')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let q = SqliteQueue::new(db);
        let job = process();
        q.enqueue(&job).unwrap();
        assert_eq!(q.lease(Duration::from_secs(60)).unwrap().unwrap().job, job);
        assert_eq!(q.pending().unwrap(), 1);
    }
}
