use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "docpipe";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ENV_CONFIG: &str = "DOCPIPE_CONFIG";
pub const ENV_DATA_DIR: &str = "DOCPIPE_DATA_DIR";
pub const ENV_WORKERS: &str = "DOCPIPE_WORKERS";
pub const ENV_LLM_URL: &str = "DOCPIPE_LLM_URL";
pub const ENV_LLM_MODEL: &str = "DOCPIPE_LLM_MODEL";
pub const ENV_OCR_URL: &str = "DOCPIPE_OCR_URL";
pub const ENV_POLL_MS: &str = "DOCPIPE_POLL_MS";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "docpipe_lib=info,docpipe=info"
}

/// Get the application data directory
/// ~/docpipe/ unless overridden by `DOCPIPE_DATA_DIR`.
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(APP_NAME)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Process-wide settings. Per-document tunables live on the RuleVersion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub workers: usize,
    pub llm_url: String,
    /// Model used when a rule does not name one.
    pub llm_model: String,
    /// Remote OCR endpoint. Without it, pages are read as embedded text.
    pub ocr_url: Option<String>,
    pub poll_ms: u64,
    /// Visibility timeout for leased jobs.
    pub lease_secs: u64,
    /// Key for presigned blob URLs.
    pub blob_secret: String,
    pub presign_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: app_data_dir(),
            workers: 2,
            llm_url: "http://localhost:11434".into(),
            llm_model: "llama3.1:8b".into(),
            ocr_url: None,
            poll_ms: 500,
            lease_secs: 300,
            blob_secret: "docpipe-local-presign".into(),
            presign_ttl_secs: 3600,
        }
    }
}

impl Settings {
    /// Defaults, then the JSON file named by `DOCPIPE_CONFIG`, then env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match std::env::var(ENV_CONFIG) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = parse_var(ENV_WORKERS, &workers)?;
        }
        if let Some(url) = lookup(ENV_LLM_URL) {
            self.llm_url = url;
        }
        if let Some(model) = lookup(ENV_LLM_MODEL) {
            self.llm_model = model;
        }
        if let Some(url) = lookup(ENV_OCR_URL) {
            self.ocr_url = Some(url);
        }
        if let Some(ms) = lookup(ENV_POLL_MS) {
            self.poll_ms = parse_var(ENV_POLL_MS, &ms)?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("docpipe.db")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Root of the on-disk rule store (`rules/` and `targets/`).
    pub fn rules_dir(&self) -> PathBuf {
        self.data_dir.join("config")
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.into(),
        value: value.into(),
    })
}
