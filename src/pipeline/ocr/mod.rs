pub mod engine;
pub mod merge;
pub mod orchestrator;
pub mod pages;
pub mod source;

pub use engine::*;
pub use merge::*;
pub use orchestrator::*;
pub use pages::*;
pub use source::*;

use thiserror::Error;

use crate::models::ErrorClass;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR engine '{engine}' failed: {message}")]
    Engine { engine: String, message: String },

    #[error("Unknown OCR engine: {0}")]
    UnknownEngine(String),

    #[error("OCR exceeded its {secs}s wall-clock limit")]
    Timeout { secs: u64 },

    #[error("Invalid page expression '{expr}': {reason}")]
    InvalidPageExpression { expr: String, reason: String },

    #[error("No readable pages selected (document has {page_count} pages)")]
    NoPages { page_count: usize },

    #[error("Unreadable document: {0}")]
    Unreadable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR worker crashed: {0}")]
    Worker(String),
}

impl OcrError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::Engine { .. } | Self::Timeout { .. } | Self::Http(_) | Self::Worker(_) => {
                ErrorClass::TransientIo
            }
            Self::UnknownEngine(_)
            | Self::InvalidPageExpression { .. }
            | Self::NoPages { .. }
            | Self::Unreadable(_) => ErrorClass::Content,
        }
    }
}
