//! Task lifecycle. This is the only code that changes `Task::state`.
//!
//! ```text
//! Queued -> Processing -> { PendingReview | Completed | Failed }
//! PendingReview -> { Completed | Rejected }        (human decision)
//! Completed -> Pushing -> { PushSuccess | PushFailed }
//! PushFailed -> PushSuccess                        (manual redelivery)
//! ```

use chrono::Utc;
use thiserror::Error;

use crate::models::{Task, TaskState, Transition};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

pub fn is_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Queued, Processing)
            | (Processing, PendingReview)
            | (Processing, Completed)
            | (Processing, Failed)
            | (PendingReview, Completed)
            | (PendingReview, Rejected)
            | (Completed, Pushing)
            | (Pushing, PushSuccess)
            | (Pushing, PushFailed)
            | (PushFailed, PushSuccess)
    )
}

/// Transitions only a reviewer or operator may trigger.
pub fn is_human_only(from: TaskState, to: TaskState) -> bool {
    matches!(
        (from, to),
        (TaskState::PendingReview, _) | (TaskState::PushFailed, TaskState::PushSuccess)
    )
}

/// Move `task` to `to`, appending a timestamped transition.
///
/// Timestamps never go backwards within one Task, so the timeline stays
/// ordered even if the wall clock is adjusted.
pub fn transition(task: &mut Task, to: TaskState, note: Option<String>) -> Result<(), TransitionError> {
    let from = task.state;
    if !is_allowed(from, to) {
        tracing::warn!(task_id = %task.id, from = %from, to = %to, "Rejected task transition");
        return Err(TransitionError { from, to });
    }
    let mut at = Utc::now();
    if let Some(last) = task.transitions.last() {
        at = at.max(last.at);
    }
    task.transitions.push(Transition {
        from: Some(from),
        to,
        at,
        note,
    });
    task.state = to;
    task.updated_at = at;
    tracing::info!(task_id = %task.id, from = %from, to = %to, "Task transition");
    Ok(())
}
