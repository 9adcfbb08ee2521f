//! Per-(repository, track) cached update tracking
//!
//! A cache entry moves through unknown → checking → cached. Within the
//! staleness window `check` answers from the cache without touching the
//! network. The "update available" comparison always runs against the
//! caller's own installed marker, never a global field — two installations
//! of the same repository may legitimately disagree.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{Duration, Utc};
use semver::Version;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crucible_core::types::{UpdateInfo, UpdateTrack};

use crate::releases::{Release, ReleaseClient};

#[derive(Debug, Clone)]
struct CacheEntry {
    release: Release,
    checked_at: chrono::DateTime<Utc>,
}

/// Cached release tracker shared across installations
pub struct UpdateTracker {
    client: ReleaseClient,
    ttl: Duration,
    // Read-mostly; writes serialized per key by holding the map lock across
    // insert only (the fetch itself runs outside the lock).
    cache: Mutex<HashMap<(String, UpdateTrack), CacheEntry>>,
}

impl UpdateTracker {
    /// Create a tracker over the given releases host
    pub fn new(base_url: impl Into<String>, ttl_secs: u64) -> Result<Self> {
        Ok(Self {
            client: ReleaseClient::new(base_url)?,
            ttl: Duration::seconds(ttl_secs as i64),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Check for an update against the installation's own installed marker
    ///
    /// Returns the cached comparison when fresh; otherwise fetches, caches,
    /// and compares. `installed_tag` of None always reads as "update
    /// available" once a release exists.
    pub async fn check(
        &self,
        repository: &str,
        track: UpdateTrack,
        installed_tag: Option<&str>,
    ) -> Result<UpdateInfo> {
        let key = (repository.to_string(), track);

        let cached = {
            let cache = self.cache.lock().await;
            cache.get(&key).cloned()
        };

        let entry = match cached {
            Some(entry) if Utc::now() - entry.checked_at < self.ttl => {
                debug!(
                    "Release cache fresh for {} ({})",
                    repository,
                    track.as_str()
                );
                entry
            }
            _ => {
                info!(
                    "Checking releases host for {} ({})",
                    repository,
                    track.as_str()
                );
                let release = self.client.get_latest(repository, track).await?;
                let entry = CacheEntry {
                    release,
                    checked_at: Utc::now(),
                };
                self.cache.lock().await.insert(key, entry.clone());
                entry
            }
        };

        Ok(compare(&entry, installed_tag))
    }

    /// Drop the cached entry for one key, forcing the next check to fetch
    pub async fn invalidate(&self, repository: &str, track: UpdateTrack) {
        self.cache
            .lock()
            .await
            .remove(&(repository.to_string(), track));
    }
}

/// Build the per-installation comparison from a cache entry
fn compare(entry: &CacheEntry, installed_tag: Option<&str>) -> UpdateInfo {
    let latest = &entry.release.tag_name;
    let update_available = match installed_tag {
        None => true,
        Some(installed) => tags_differ(installed, latest),
    };

    UpdateInfo {
        latest_tag: latest.clone(),
        release_name: entry.release.name.clone(),
        release_notes: entry.release.body.clone(),
        published_at: entry.release.published_at,
        checked_at: entry.checked_at,
        update_available,
    }
}

/// Compare two release tags, semver-aware where possible
fn tags_differ(installed: &str, latest: &str) -> bool {
    let norm_installed = installed.strip_prefix('v').unwrap_or(installed);
    let norm_latest = latest.strip_prefix('v').unwrap_or(latest);

    match (Version::parse(norm_installed), Version::parse(norm_latest)) {
        (Ok(a), Ok(b)) => a != b,
        _ => norm_installed != norm_latest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: &str) -> CacheEntry {
        CacheEntry {
            release: Release {
                tag_name: tag.to_string(),
                name: Some("Release".to_string()),
                body: None,
                prerelease: false,
                draft: false,
                assets: Vec::new(),
                published_at: None,
            },
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_comparison_is_per_installation() {
        let cached = entry("v1.2.0");

        // Two installations of the same repository, different markers,
        // different answers from the same cache entry.
        let behind = compare(&cached, Some("v1.1.0"));
        let current = compare(&cached, Some("v1.2.0"));

        assert!(behind.update_available);
        assert!(!current.update_available);
    }

    #[test]
    fn test_no_installed_marker_reads_as_available() {
        assert!(compare(&entry("v1.0.0"), None).update_available);
    }

    #[test]
    fn test_tag_comparison_ignores_v_prefix() {
        assert!(!tags_differ("v1.2.0", "1.2.0"));
        assert!(tags_differ("v1.2.0", "v1.3.0"));
    }

    #[test]
    fn test_non_semver_tags_compare_literally() {
        assert!(tags_differ("nightly-0130", "nightly-0131"));
        assert!(!tags_differ("nightly-0130", "nightly-0130"));
    }
}
