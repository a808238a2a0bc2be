//! Shared application state: one instance of every pipeline service, wired
//! to the same database, blob store, rule store and queue.
//!
//! The CLI builds it from `Settings`; tests assemble it from in-memory
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::blob::{BlobError, BlobStore, FsBlobStore};
use crate::config::{ConfigError, Settings};
use crate::db::{Database, DatabaseError};
use crate::pipeline::extraction::ExtractionEngine;
use crate::pipeline::fingerprint::DedupService;
use crate::pipeline::llm::{BreakerRegistry, GuardedLlm, LlmClient};
use crate::pipeline::ocr::{EngineRegistry, OcrOrchestrator, PageSource, TextPageSource};
use crate::pipeline::processor::DocumentProcessor;
use crate::pipeline::push::{PushDispatcher, PushError};
use crate::pipeline::review::ReviewService;
use crate::pipeline::worker::{WorkerOptions, WorkerPool};
use crate::queue::{JobQueue, SqliteQueue};
use crate::rules::{CachedRuleStore, DirRuleStore, RuleStore};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Push setup failed: {0}")]
    Push(#[from] PushError),

    #[error("Cannot create data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Collaborators the services are built on.
pub struct Collaborators {
    pub db: Arc<Database>,
    pub blobs: Arc<dyn BlobStore>,
    pub rules: Arc<dyn RuleStore>,
    pub queue: Arc<dyn JobQueue>,
    pub pages: Arc<dyn PageSource>,
    pub engines: EngineRegistry,
    pub llm: Option<Arc<dyn LlmClient>>,
}

pub struct CoreState {
    pub settings: Settings,
    pub db: Arc<Database>,
    pub blobs: Arc<dyn BlobStore>,
    pub rules: Arc<dyn RuleStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Process-wide; shared by every Task that reaches the LLM.
    pub breakers: Arc<BreakerRegistry>,
    pub dedup: DedupService,
    pub processor: Arc<DocumentProcessor>,
    pub dispatcher: Arc<PushDispatcher>,
    pub review: ReviewService,
}

impl CoreState {
    /// On-disk state under `settings.data_dir`.
    pub fn open(
        settings: Settings,
        engines: EngineRegistry,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let db = Arc::new(Database::open(&settings.database_path())?);
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&settings.blobs_dir(), &settings.blob_secret)?);
        let rules: Arc<dyn RuleStore> = Arc::new(CachedRuleStore::new(DirRuleStore::new(&settings.rules_dir())));
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteQueue::new(db.clone()));
        tracing::info!(data_dir = %settings.data_dir.display(), "Opened docpipe state");

        Self::assemble(
            settings,
            Collaborators {
                db,
                blobs,
                rules,
                queue,
                pages: Arc::new(TextPageSource),
                engines,
                llm,
            },
        )
    }

    pub fn assemble(settings: Settings, parts: Collaborators) -> Result<Self, CoreError> {
        let Collaborators {
            db,
            blobs,
            rules,
            queue,
            pages,
            engines,
            llm,
        } = parts;

        let breakers = Arc::new(BreakerRegistry::new());
        let extraction = match llm {
            Some(client) => ExtractionEngine::new(Some(GuardedLlm::new(client, breakers.clone(), &settings.llm_model))),
            None => ExtractionEngine::ocr_only(),
        };
        let processor = Arc::new(DocumentProcessor::new(
            db.clone(),
            blobs.clone(),
            rules.clone(),
            pages,
            OcrOrchestrator::new(engines),
            extraction,
        ));
        let dispatcher = Arc::new(PushDispatcher::new(
            db.clone(),
            rules.clone(),
            queue.clone(),
            blobs.clone(),
            Duration::from_secs(settings.presign_ttl_secs),
        )?);
        let dedup = DedupService::new(db.clone(), blobs.clone(), rules.clone(), queue.clone());
        let review = ReviewService::new(db.clone(), rules.clone(), dispatcher.clone());

        Ok(Self {
            settings,
            db,
            blobs,
            rules,
            queue,
            breakers,
            dedup,
            processor,
            dispatcher,
            review,
        })
    }

    pub fn worker_pool(&self) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            self.queue.clone(),
            self.processor.clone(),
            self.dispatcher.clone(),
            WorkerOptions::from_settings(&self.settings),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::PlainTextOcr;

    #[test]
    fn opens_fresh_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().join("state"),
            ..Settings::default()
        };
        let engines = EngineRegistry::new().with("default", Arc::new(PlainTextOcr));
        let core = CoreState::open(settings, engines, None).unwrap();
        assert!(core.settings.database_path().exists());
        assert_eq!(core.queue.pending().unwrap(), 0);
        assert!(core.breakers.snapshots().is_empty());
    }
}
