//! Per-document OCR: page selection, per-page recognition with engine
//! fallback, bounded parallelism above a page threshold, a wall-clock
//! ceiling, and a strictly ordered merge.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{resolve_pages, EngineRegistry, MergedDocument, OcrEngine, OcrError, PageImage};
use crate::models::{OcrSettings, PageOcr};

/// Orchestrator output. Page-level failures are warnings, not errors.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub document: MergedDocument,
    /// Pages in the source file, read or not.
    pub page_count: usize,
    pub warnings: Vec<String>,
}

struct PageRead {
    page: PageOcr,
    warnings: Vec<String>,
}

type EngineChain = Arc<Vec<(String, Arc<dyn OcrEngine>)>>;

pub struct OcrOrchestrator {
    engines: EngineRegistry,
}

impl OcrOrchestrator {
    pub fn new(engines: EngineRegistry) -> Self {
        Self { engines }
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub async fn process(
        &self,
        pages: Vec<PageImage>,
        settings: &OcrSettings,
    ) -> Result<OcrOutcome, OcrError> {
        let page_count = pages.len();
        let selection = resolve_pages(&settings.page_strategy, page_count)?;
        let mut warnings = selection.skipped_warnings(page_count);

        let (chain, chain_warnings) = self.engine_chain(settings)?;
        warnings.extend(chain_warnings);

        let selected: Vec<PageImage> = pages
            .into_iter()
            .filter(|p| selection.pages.contains(&p.number))
            .collect();
        let limit = settings.timeout.for_pages(selected.len());
        let parallel = selected.len() > settings.parallel_threshold;

        tracing::info!(
            pages = selected.len(),
            page_count,
            parallel,
            engine = %settings.engine,
            timeout_secs = limit.as_secs(),
            "Starting OCR"
        );

        let started = Instant::now();
        let reads = if parallel {
            tokio::time::timeout(limit, run_parallel(selected, chain, settings.max_workers.max(1))).await
        } else {
            tokio::time::timeout(limit, run_sequential(selected, chain)).await
        };
        let reads = match reads {
            Ok(reads) => reads?,
            Err(_) => {
                tracing::error!(timeout_secs = limit.as_secs(), "OCR wall-clock limit exceeded");
                return Err(OcrError::Timeout {
                    secs: limit.as_secs(),
                });
            }
        };

        let mut page_results = Vec::with_capacity(reads.len());
        for read in reads {
            warnings.extend(read.warnings);
            page_results.push(read.page);
        }
        let document = MergedDocument::from_pages(page_results, &settings.separator);

        tracing::info!(
            pages = document.pages.len(),
            chars = document.text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "OCR complete"
        );

        Ok(OcrOutcome {
            document,
            page_count,
            warnings,
        })
    }

    /// Primary engine first, then fallbacks in declared order. An unknown
    /// primary is a configuration error; unknown fallbacks are skipped.
    fn engine_chain(&self, settings: &OcrSettings) -> Result<(EngineChain, Vec<String>), OcrError> {
        let primary = self
            .engines
            .get(&settings.engine)
            .ok_or_else(|| OcrError::UnknownEngine(settings.engine.clone()))?;
        let mut chain = vec![(settings.engine.clone(), primary)];
        let mut warnings = Vec::new();
        for name in &settings.fallbacks {
            match self.engines.get(name) {
                Some(engine) => chain.push((name.clone(), engine)),
                None => {
                    tracing::warn!(engine = %name, "Fallback OCR engine not registered");
                    warnings.push(format!("Fallback OCR engine '{name}' is not available"));
                }
            }
        }
        Ok((Arc::new(chain), warnings))
    }
}

async fn run_sequential(pages: Vec<PageImage>, chain: EngineChain) -> Result<Vec<PageRead>, OcrError> {
    let mut reads = Vec::with_capacity(pages.len());
    for page in pages {
        reads.push(read_page_blocking(page, chain.clone()).await?);
    }
    Ok(reads)
}

async fn run_parallel(
    pages: Vec<PageImage>,
    chain: EngineChain,
    max_workers: usize,
) -> Result<Vec<PageRead>, OcrError> {
    let semaphore = Arc::new(Semaphore::new(max_workers));
    let mut set = JoinSet::new();

    for page in pages {
        let semaphore = semaphore.clone();
        let chain = chain.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| OcrError::Worker(e.to_string()))?;
            read_page_blocking(page, chain).await
        });
    }

    let mut reads = Vec::new();
    while let Some(joined) = set.join_next().await {
        let read = joined.map_err(|e| OcrError::Worker(e.to_string()))??;
        reads.push(read);
    }
    // Completion order is arbitrary; the merge sorts by page number.
    Ok(reads)
}

async fn read_page_blocking(page: PageImage, chain: EngineChain) -> Result<PageRead, OcrError> {
    tokio::task::spawn_blocking(move || read_page(&page, &chain))
        .await
        .map_err(|e| OcrError::Worker(e.to_string()))
}

/// Try each engine in order until one returns usable text.
fn read_page(page: &PageImage, chain: &[(String, Arc<dyn OcrEngine>)]) -> PageRead {
    let mut warnings = Vec::new();
    for (i, (name, engine)) in chain.iter().enumerate() {
        match engine.recognize(page) {
            Ok(result) if result.is_usable() => {
                if i > 0 {
                    tracing::warn!(page = page.number, engine = %name, "Page read by fallback engine");
                    warnings.push(format!("Page {} read by fallback engine '{name}'", page.number));
                }
                tracing::debug!(
                    page = page.number,
                    engine = %name,
                    confidence = result.confidence,
                    "Page recognized"
                );
                return PageRead {
                    page: PageOcr {
                        page_number: page.number,
                        text: result.text,
                        confidence: result.confidence,
                        blocks: result.blocks,
                        engine: Some(name.clone()),
                    },
                    warnings,
                };
            }
            Ok(_) => {
                tracing::warn!(page = page.number, engine = %name, "Empty or zero-confidence OCR result");
            }
            Err(e) => {
                tracing::warn!(page = page.number, engine = %name, error = %e, "OCR engine failed");
            }
        }
    }
    tracing::warn!(page = page.number, "All OCR engines failed, page left empty");
    warnings.push(format!("Page {} unreadable by all OCR engines", page.number));
    PageRead {
        page: PageOcr::empty(page.number),
        warnings,
    }
}
