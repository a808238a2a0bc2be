//! Document processing driver.
//!
//! Runs one Task end-to-end: rule -> blob -> page split -> OCR -> extraction
//! -> consistency -> cleaning -> validation, then decides the next state.
//! Stage functions return structured outcomes; this is the only place that
//! turns them into `TaskState` transitions.
//!
//! Collaborators are injected as trait objects so the driver runs unchanged
//! against mocks in tests.

use std::sync::Arc;

use uuid::Uuid;

use super::extraction::{ExtractionEngine, ExtractionError};
use super::ocr::{OcrError, OcrOrchestrator, PageSource};
use super::state::{self, TransitionError};
use super::validation::{self, ValidationReport};
use super::{cleaning, consistency};
use crate::blob::{BlobError, BlobStore};
use crate::db::{self, Database, DatabaseError};
use crate::models::{ErrorClass, FailureInfo, Stage, Task, TaskState};
use crate::queue::QueueError;
use crate::rules::{RuleError, RuleStore};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while driving a Task.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("OCR failed: {0}")]
    Ocr(#[from] OcrError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Push error: {0}")]
    Push(#[from] super::push::PushError),
}

impl ProcessingError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::Database(_) | Self::Blob(_) | Self::Queue(_) => ErrorClass::TransientIo,
            Self::Rule(e) => e.error_class(),
            Self::Ocr(e) => e.error_class(),
            Self::Extraction(e) => e.error_class(),
            Self::Transition(_) => ErrorClass::Content,
            Self::Push(e) => e.error_class(),
        }
    }
}

/// A stage error with the stage it belongs to.
struct StageFailure {
    stage: Stage,
    error: ProcessingError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<ProcessingError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|e| StageFailure {
            stage,
            error: e.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct DocumentProcessor {
    db: Arc<Database>,
    blobs: Arc<dyn BlobStore>,
    rules: Arc<dyn RuleStore>,
    pages: Arc<dyn PageSource>,
    ocr: OcrOrchestrator,
    extraction: ExtractionEngine,
}

impl DocumentProcessor {
    pub fn new(
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        rules: Arc<dyn RuleStore>,
        pages: Arc<dyn PageSource>,
        ocr: OcrOrchestrator,
        extraction: ExtractionEngine,
    ) -> Self {
        Self {
            db,
            blobs,
            rules,
            pages,
            ocr,
            extraction,
        }
    }

    /// Drive a Task from Queued to PendingReview, Completed or Failed.
    ///
    /// A Task found in Processing was leased by a worker that died; it is
    /// run again from the start. Tasks in any other state are returned
    /// untouched, which makes queue redelivery harmless.
    ///
    /// Stage failures are not errors of this function: they end in Failed
    /// with the stage recorded. `Err` means the Task could not be loaded or
    /// persisted.
    pub async fn process(&self, task_id: Uuid) -> Result<Task, ProcessingError> {
        let mut task = self.db.with(|conn| db::require_task(conn, &task_id))?;
        match task.state {
            TaskState::Queued => {
                state::transition(&mut task, TaskState::Processing, None)?;
                self.db.with(|conn| db::update_task(conn, &task))?;
            }
            TaskState::Processing => {
                tracing::warn!(task_id = %task.id, "Resuming task left in processing");
                reset_results(&mut task);
            }
            other => {
                tracing::debug!(task_id = %task.id, state = %other, "Task already past processing");
                return Ok(task);
            }
        }

        match self.run_stages(&mut task).await {
            Ok(report) => {
                let next = if report.passed() {
                    TaskState::Completed
                } else {
                    TaskState::PendingReview
                };
                task.warnings.extend(report.warnings);
                task.review_reasons = report.reasons;
                state::transition(&mut task, next, None)?;
                tracing::info!(
                    task_id = %task.id,
                    state = %next,
                    fields = task.fields.len(),
                    reasons = task.review_reasons.len(),
                    confidence = task.overall_confidence(),
                    "Task processed"
                );
            }
            Err(StageFailure { stage, error }) => {
                let class = error.error_class();
                tracing::error!(
                    task_id = %task.id,
                    stage = %stage,
                    class = %class,
                    error = %error,
                    "Task failed"
                );
                task.failure = Some(FailureInfo {
                    stage,
                    class,
                    message: error.to_string(),
                });
                state::transition(&mut task, TaskState::Failed, Some(format!("{stage}: {error}")))?;
            }
        }

        self.db.with(|conn| db::update_task(conn, &task))?;
        Ok(task)
    }

    /// Give up on a Task whose job kept failing outside the stages, for
    /// example because its state could not be persisted. A Queued or
    /// Processing Task ends in Failed as `TransientIo`; `None` when the Task
    /// is missing or already past processing.
    pub fn abandon(&self, task_id: Uuid, reason: &str) -> Result<Option<Task>, ProcessingError> {
        let Some(mut task) = self.db.with(|conn| db::get_task(conn, &task_id))? else {
            return Ok(None);
        };
        if task.state == TaskState::Queued {
            state::transition(&mut task, TaskState::Processing, None)?;
        }
        if task.state != TaskState::Processing {
            return Ok(None);
        }

        tracing::error!(task_id = %task.id, reason, "Task abandoned after repeated job failures");
        reset_results(&mut task);
        task.failure = Some(FailureInfo {
            stage: Stage::Storage,
            class: ErrorClass::TransientIo,
            message: reason.to_string(),
        });
        state::transition(&mut task, TaskState::Failed, Some(format!("abandoned: {reason}")))?;
        self.db.with(|conn| db::update_task(conn, &task))?;
        Ok(Some(task))
    }

    async fn run_stages(&self, task: &mut Task) -> Result<ValidationReport, StageFailure> {
        let rule = self
            .rules
            .get_config(&task.rule_id, task.rule_version)
            .at(Stage::Extraction)?;

        let bytes = self.blobs.get(&task.file.storage_ref).at(Stage::Storage)?;
        let pages = self.pages.split(&bytes).at(Stage::Ocr)?;

        // OCR
        let ocr = self.ocr.process(pages, &rule.ocr).await.at(Stage::Ocr)?;
        task.page_count = ocr.page_count;
        task.warnings.extend(ocr.warnings);
        if ocr.document.pages.iter().all(|p| p.is_empty()) {
            return Err(OcrError::Unreadable("no text recognised on any selected page".into())).at(Stage::Ocr);
        }
        task.merged_text = ocr.document.text.clone();
        task.pages = ocr.document.pages.clone();
        tracing::debug!(task_id = %task.id, chars = task.merged_text.len(), "OCR merged");

        // Extraction
        let extracted = self.extraction.extract(&ocr.document, &rule).await.at(Stage::Extraction)?;
        task.llm_usage.merge(&extracted.usage);
        task.warnings.extend(extracted.warnings);
        let mut fields = extracted.fields;

        // Consistency runs on raw values so both paths are compared as read
        let consistency = consistency::check(&self.extraction, &ocr.document, &rule, &fields)
            .await
            .at(Stage::Consistency)?;
        task.llm_usage.merge(&consistency.usage);
        task.warnings.extend(consistency.warnings);

        task.warnings.extend(cleaning::apply(&mut fields, &rule.cleaning));

        let mut report = validation::validate(&fields, &rule);
        for reason in consistency.reasons {
            report.push(reason);
        }
        task.fields = fields;
        Ok(report)
    }
}

/// Clear partial output from an interrupted run.
fn reset_results(task: &mut Task) {
    task.page_count = 0;
    task.merged_text.clear();
    task.pages.clear();
    task.fields.clear();
    task.review_reasons.clear();
    task.warnings.clear();
    task.failure = None;
    task.llm_usage = Default::default();
}
