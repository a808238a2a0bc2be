pub mod dispatcher;
pub mod template;

pub use dispatcher::*;
pub use template::*;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::blob::BlobError;
use crate::db::DatabaseError;
use crate::models::{ErrorClass, TaskState};
use crate::pipeline::state::TransitionError;
use crate::queue::QueueError;
use crate::rules::RuleError;
use crate::signing::SigningError;

/// Attempts per (task, target) before dead-lettering.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay after failed attempt k is `BACKOFF_SECS[k - 1]`. The last entry is
/// only recorded for diagnostics; attempt 3 dead-letters instead.
pub const BACKOFF_SECS: [u64; MAX_ATTEMPTS as usize] = [10, 30, 90];

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Rule store error: {0}")]
    Rule(#[from] RuleError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid target '{target_id}': {reason}")]
    InvalidTarget { target_id: String, reason: String },

    #[error("Task {task_id} cannot be delivered in state {state}")]
    NotDeliverable { task_id: Uuid, state: TaskState },

    #[error("A delivery to '{target_id}' for task {task_id} is already in flight")]
    InFlight { task_id: Uuid, target_id: String },

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl PushError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::Database(_) | Self::Queue(_) | Self::Blob(_) => ErrorClass::TransientIo,
            _ => ErrorClass::Delivery,
        }
    }
}

/// Result of one attempt against one target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub target_id: String,
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// Delay before the next scheduled attempt, when one was scheduled.
    pub next_retry: Option<Duration>,
    pub dead_lettered: bool,
}
