//! Content-addressed download cache
//!
//! Archives are stored under a key derived from (release identifier,
//! variant or filename) so re-installing the same release, or retrying
//! after a failure, reuses the already-downloaded file. Eviction is the
//! cache collaborator's concern, not this pipeline's.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Derive the deterministic cache key for (release identifier, variant)
pub fn cache_key(release_id: &str, variant: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(release_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(variant.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Filesystem cache of downloaded archives
#[derive(Debug, Clone)]
pub struct DownloadCache {
    dir: PathBuf,
}

impl DownloadCache {
    /// Create a cache rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Final path of a cached file for (key, filename)
    pub fn entry_path(&self, key: &str, filename: &str) -> PathBuf {
        self.dir.join(key).join(filename)
    }

    /// Path used while a download is in flight
    pub fn staging_path(&self, key: &str, filename: &str) -> PathBuf {
        self.dir.join(key).join(format!("{}.part", filename))
    }

    /// Return the cached file if it already exists
    pub fn lookup(&self, key: &str, filename: &str) -> Option<PathBuf> {
        let path = self.entry_path(key, filename);
        if path.is_file() {
            debug!("Cache hit: {}", path.display());
            Some(path)
        } else {
            None
        }
    }

    /// Promote a fully-downloaded staging file to its final cache path
    pub fn commit(&self, key: &str, filename: &str) -> Result<PathBuf> {
        let staging = self.staging_path(key, filename);
        let path = self.entry_path(key, filename);
        fs::rename(&staging, &path)
            .with_context(|| format!("Failed to commit cache entry {}", path.display()))?;
        Ok(path)
    }

    /// Ensure the key's directory exists and return it
    pub fn ensure_key_dir(&self, key: &str) -> Result<PathBuf> {
        let dir = self.dir.join(key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Drop an abandoned staging file, ignoring errors
    pub fn discard_staging(&self, key: &str, filename: &str) {
        let _ = fs::remove_file(self.staging_path(key, filename));
    }

    /// Cache root
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
