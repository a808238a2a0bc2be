pub mod anchor;
pub mod confidence;
pub mod engine;
pub mod llm;
pub mod pattern;
pub mod table;
pub mod table_detect;

pub use engine::*;

use thiserror::Error;

use crate::models::ErrorClass;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Malformed LLM output: {0}")]
    LlmOutput(String),

    #[error("Extraction crashed: {0}")]
    Internal(String),
}

impl ExtractionError {
    pub fn error_class(&self) -> ErrorClass {
        ErrorClass::Content
    }
}

/// A value located by one strategy, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: serde_json::Value,
    pub source_page: Option<usize>,
    /// Strategy-specific certainty, 0.0-1.0.
    pub match_quality: f32,
    /// Confidence of the exact OCR blocks read, when the strategy knows them.
    pub ocr_confidence: Option<f32>,
    pub row_pages: Vec<usize>,
}

impl Candidate {
    pub fn new(value: serde_json::Value, source_page: Option<usize>, match_quality: f32) -> Self {
        Self {
            value,
            source_page,
            match_quality,
            ocr_confidence: None,
            row_pages: Vec::new(),
        }
    }
}
