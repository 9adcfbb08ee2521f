//! Multi-file download with caching and progress
//!
//! Files are fetched in the order supplied; progress is reported as
//! percent-of-bytes across the whole set. A cache hit skips the network
//! entirely. Cancellation is checked before each file and per chunk.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crucible_core::types::{DownloadFile, ProgressReporter};
use crucible_core::{CancelToken, Error};

use crate::cache::{cache_key, DownloadCache};

/// Progress phase name used by download events
pub const PHASE_DOWNLOAD: &str = "download";

/// Downloader over a shared HTTP client and archive cache
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    cache: DownloadCache,
}

impl Downloader {
    /// Create a downloader with its own client
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("crucible/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            cache: DownloadCache::new(cache_dir),
        })
    }

    /// The cache backing this downloader
    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    /// Fetch every file of a release set, in order, returning cache paths
    ///
    /// All-or-nothing: the first failure aborts the remaining files. Bytes
    /// already landed in the cache stay there so a retry resumes cheaply.
    pub async fn fetch_all(
        &self,
        release_id: &str,
        files: &[DownloadFile],
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let total_bytes: u64 = files.iter().map(|f| f.expected_size).sum();
        let mut done_bytes: u64 = 0;
        let mut paths = Vec::with_capacity(files.len());

        for file in files {
            cancel.err_if_cancelled()?;
            let path = self
                .fetch_one(release_id, file, total_bytes, &mut done_bytes, reporter, cancel)
                .await?;
            paths.push(path);
        }

        Ok(paths)
    }

    pub(crate) async fn fetch_one(
        &self,
        release_id: &str,
        file: &DownloadFile,
        total_bytes: u64,
        done_bytes: &mut u64,
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        let key = cache_key(release_id, &file.filename);

        if let Some(path) = self.cache.lookup(&key, &file.filename) {
            info!("Using cached archive for {}", file.filename);
            *done_bytes += file.expected_size;
            reporter.flat(
                PHASE_DOWNLOAD,
                format!("{} (cached)", file.filename),
                percent(*done_bytes, total_bytes),
            );
            return Ok(path);
        }

        debug!("Fetching {} from {}", file.filename, file.url);
        self.cache.ensure_key_dir(&key)?;
        let staging = self.cache.staging_path(&key, &file.filename);

        let result = self
            .stream_to_staging(file, &staging, total_bytes, *done_bytes, reporter, cancel)
            .await;

        match result {
            Ok(written) => {
                if file.expected_size > 0 && written != file.expected_size {
                    self.cache.discard_staging(&key, &file.filename);
                    return Err(anyhow!(Error::download_failed(format!(
                        "{}: size mismatch, expected {} bytes, got {}",
                        file.filename, file.expected_size, written
                    ))));
                }
                *done_bytes += if file.expected_size > 0 {
                    file.expected_size
                } else {
                    written
                };
                let path = self.cache.commit(&key, &file.filename)?;
                reporter.flat(
                    PHASE_DOWNLOAD,
                    file.filename.clone(),
                    percent(*done_bytes, total_bytes),
                );
                Ok(path)
            }
            Err(err) => {
                self.cache.discard_staging(&key, &file.filename);
                Err(err)
            }
        }
    }

    async fn stream_to_staging(
        &self,
        file: &DownloadFile,
        staging: &std::path::Path,
        total_bytes: u64,
        set_done_bytes: u64,
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let response = self
            .client
            .get(&file.url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", file.url))?;

        if !response.status().is_success() {
            return Err(anyhow!(Error::download_failed(format!(
                "{}: server returned {}",
                file.filename,
                response.status()
            ))));
        }

        let mut out = tokio::fs::File::create(staging)
            .await
            .with_context(|| format!("Failed to create {}", staging.display()))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(anyhow!(Error::Cancelled));
            }
            let chunk = chunk.context("Failed to read download chunk")?;
            out.write_all(&chunk)
                .await
                .context("Failed to write download chunk")?;
            written += chunk.len() as u64;
            reporter.flat(
                PHASE_DOWNLOAD,
                file.filename.clone(),
                percent(set_done_bytes + written, total_bytes),
            );
        }

        out.flush().await?;
        Ok(written)
    }

    /// Drop a cached entry, for corrupt-archive recovery
    pub fn evict(&self, release_id: &str, filename: &str) {
        let key = cache_key(release_id, filename);
        let _ = fs::remove_file(self.cache.entry_path(&key, filename));
    }
}

fn percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        -1.0
    } else {
        (done as f64 / total as f64 * 100.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of_bytes() {
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(200, 200), 100.0);
    }

    #[test]
    fn test_percent_unknown_total_is_indeterminate() {
        assert_eq!(percent(1024, 0), -1.0);
    }
}
