//! Blob storage collaborator: put / get / presign / delete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::signing::{hmac_hex, tokens_match, SigningError};

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob reference: {0}")]
    InvalidRef(String),

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Blob store lock poisoned")]
    LockPoisoned,
}

pub trait BlobStore: Send + Sync {
    /// Store bytes and return an opaque reference.
    fn put(&self, bytes: &[u8]) -> Result<String, BlobError>;
    fn get(&self, reference: &str) -> Result<Vec<u8>, BlobError>;
    /// Time-limited URL for downstream consumers.
    fn presign(&self, reference: &str, ttl: Duration) -> Result<String, BlobError>;
    fn delete(&self, reference: &str) -> Result<(), BlobError>;
}

/// Hex SHA-256 of the content. Doubles as the blob reference.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn check_ref(reference: &str) -> Result<(), BlobError> {
    if reference.len() == 64 && reference.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(BlobError::InvalidRef(reference.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Content-addressed store: `<root>/<hash[0..2]>/<hash>`.
pub struct FsBlobStore {
    root: PathBuf,
    secret: String,
}

impl FsBlobStore {
    pub fn new(root: &Path, secret: &str) -> Result<Self, BlobError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            secret: secret.to_string(),
        })
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf, BlobError> {
        check_ref(reference)?;
        Ok(self.root.join(&reference[..2]).join(reference))
    }

    fn token(&self, reference: &str, expires: i64) -> Result<String, BlobError> {
        Ok(hmac_hex(self.secret.as_bytes(), format!("{reference}:{expires}").as_bytes())?)
    }

    /// Check a URL produced by `presign`: token valid and not expired.
    pub fn verify_presigned(&self, url: &str) -> bool {
        let Some((path, query)) = url.split_once('?') else {
            return false;
        };
        let Some(reference) = path.rsplit('/').next() else {
            return false;
        };
        let mut expires = None;
        let mut token = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse::<i64>().ok(),
                Some(("token", v)) => token = Some(v),
                _ => {}
            }
        }
        let (Some(expires), Some(token)) = (expires, token) else {
            return false;
        };
        if expires < Utc::now().timestamp() {
            return false;
        }
        match self.token(reference, expires) {
            Ok(expected) => tokens_match(&expected, token),
            Err(_) => false,
        }
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let reference = content_hash(bytes);
        let path = self.path_for(&reference)?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Write-then-rename so readers never see a partial blob
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &path)?;
        }
        tracing::debug!(reference = %reference, size = bytes.len(), "Stored blob");
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(reference)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn presign(&self, reference: &str, ttl: Duration) -> Result<String, BlobError> {
        let path = self.path_for(reference)?;
        if !path.exists() {
            return Err(BlobError::NotFound(reference.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let token = self.token(reference, expires)?;
        Ok(format!(
            "file://{}?expires={expires}&token={token}",
            path.display()
        ))
    }

    fn delete(&self, reference: &str) -> Result<(), BlobError> {
        let path = self.path_for(reference)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let reference = content_hash(bytes);
        self.blobs
            .lock()
            .map_err(|_| BlobError::LockPoisoned)?
            .insert(reference.clone(), bytes.to_vec());
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .map_err(|_| BlobError::LockPoisoned)?
            .get(reference)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(reference.to_string()))
    }

    fn presign(&self, reference: &str, ttl: Duration) -> Result<String, BlobError> {
        if !self.blobs.lock().map_err(|_| BlobError::LockPoisoned)?.contains_key(reference) {
            return Err(BlobError::NotFound(reference.to_string()));
        }
        Ok(format!("memory://{reference}?ttl={}", ttl.as_secs()))
    }

    fn delete(&self, reference: &str) -> Result<(), BlobError> {
        self.blobs
            .lock()
            .map_err(|_| BlobError::LockPoisoned)?
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(reference.to_string()))
    }
}
