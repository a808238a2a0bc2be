//! Human decisions on Tasks parked in PendingReview.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::push::{DeliveryOutcome, PushDispatcher, PushError};
use super::state::{self, TransitionError};
use crate::db::{self, Database, DatabaseError};
use crate::models::{ErrorClass, FieldCorrection, FieldResult, StrategyKind, Task, TaskState};
use crate::rules::{RuleError, RuleStore};

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Push error: {0}")]
    Push(#[from] PushError),

    #[error("Task {task_id} is not awaiting review (state {state})")]
    NotPending { task_id: Uuid, state: TaskState },

    #[error("Field '{0}' is not declared by the task's rule")]
    UnknownField(String),
}

impl ReviewError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::Database(_) => ErrorClass::TransientIo,
            Self::Push(e) => e.error_class(),
            Self::Rule(e) => e.error_class(),
            _ => ErrorClass::Content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Accept the Task, replacing the given field values first.
    Approve {
        #[serde(default)]
        corrections: BTreeMap<String, Value>,
    },
    Reject { reason: String },
}

#[derive(Debug)]
pub struct ReviewOutcome {
    pub task: Task,
    /// Push results when approval started delivery.
    pub deliveries: Vec<DeliveryOutcome>,
}

pub struct ReviewService {
    db: Arc<Database>,
    rules: Arc<dyn RuleStore>,
    dispatcher: Arc<PushDispatcher>,
}

impl ReviewService {
    pub fn new(db: Arc<Database>, rules: Arc<dyn RuleStore>, dispatcher: Arc<PushDispatcher>) -> Self {
        Self { db, rules, dispatcher }
    }

    pub async fn decide(&self, task_id: Uuid, decision: ReviewDecision) -> Result<ReviewOutcome, ReviewError> {
        let mut task = self.db.with(|conn| db::require_task(conn, &task_id))?;
        if task.state != TaskState::PendingReview {
            return Err(ReviewError::NotPending {
                task_id,
                state: task.state,
            });
        }

        match decision {
            ReviewDecision::Reject { reason } => {
                state::transition(&mut task, TaskState::Rejected, Some(reason))?;
                self.db.with(|conn| db::update_task(conn, &task))?;
                tracing::info!(task_id = %task_id, "Task rejected by reviewer");
                Ok(ReviewOutcome {
                    task,
                    deliveries: Vec::new(),
                })
            }
            ReviewDecision::Approve { corrections } => {
                let rule = self.rules.get_config(&task.rule_id, task.rule_version)?;
                if let Some(unknown) = corrections.keys().find(|path| rule.leaf(path).is_none()) {
                    return Err(ReviewError::UnknownField(unknown.clone()));
                }
                let count = corrections.len();
                apply_corrections(&mut task, corrections);
                state::transition(
                    &mut task,
                    TaskState::Completed,
                    Some(format!("Approved by reviewer with {count} correction(s)")),
                )?;
                self.db.with(|conn| db::update_task(conn, &task))?;
                tracing::info!(task_id = %task_id, corrections = count, "Task approved by reviewer");

                let deliveries = self.dispatcher.dispatch(task_id).await?;
                let task = self.db.with(|conn| db::require_task(conn, &task_id))?;
                Ok(ReviewOutcome { task, deliveries })
            }
        }
    }
}

fn apply_corrections(task: &mut Task, corrections: BTreeMap<String, Value>) {
    let now = Utc::now();
    for (path, value) in corrections {
        let previous = task
            .fields
            .get(&path)
            .map(|f| f.value.clone())
            .unwrap_or(Value::Null);
        task.corrections.push(FieldCorrection {
            field: path.clone(),
            previous: previous.clone(),
            corrected: value.clone(),
            corrected_at: now,
        });
        let field = task
            .fields
            .entry(path)
            .or_insert_with(|| FieldResult::empty(StrategyKind::Manual));
        if field.raw_value.is_none() {
            field.raw_value = Some(previous);
        }
        field.value = value;
        field.confidence = 100.0;
        field.strategy = StrategyKind::Manual;
    }
}
