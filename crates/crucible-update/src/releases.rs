//! Release metadata fetch and validation

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crucible_core::types::UpdateTrack;
use crucible_core::Error;

/// Release information from the releases host
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    /// Release tag (e.g. "v1.2.0")
    pub tag_name: String,

    /// Release name
    pub name: Option<String>,

    /// Release body (changelog)
    pub body: Option<String>,

    /// Whether this is a prerelease
    #[serde(default)]
    pub prerelease: bool,

    /// Whether this is a draft
    #[serde(default)]
    pub draft: bool,

    /// Release assets
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,

    /// Published date
    pub published_at: Option<DateTime<Utc>>,
}

/// Release asset
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    /// Asset name
    pub name: String,

    /// Download URL
    pub browser_download_url: String,

    /// Asset size in bytes
    pub size: u64,
}

impl Release {
    /// Structural validation of an untrusted response
    ///
    /// The tag and asset names end up in cache keys and file paths, so they
    /// must not be empty or carry path separators.
    pub fn validate(&self) -> Result<()> {
        if self.tag_name.trim().is_empty() {
            return Err(anyhow!(Error::invalid_release("empty tag name")));
        }
        if self.tag_name.contains(['/', '\\', '\0']) {
            return Err(anyhow!(Error::invalid_release(format!(
                "tag contains path separators: {}",
                self.tag_name
            ))));
        }
        for asset in &self.assets {
            if asset.name.contains(['/', '\\', '\0']) || asset.name.trim().is_empty() {
                return Err(anyhow!(Error::invalid_release(format!(
                    "asset name is not a plain filename: {}",
                    asset.name
                ))));
            }
        }
        Ok(())
    }
}

/// HTTP client for the releases host
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReleaseClient {
    /// Create a client against the given releases host base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("crucible/", env!("CARGO_PKG_VERSION")))
                .build()
                .context("Failed to create HTTP client")?,
            base_url: base_url.into(),
        })
    }

    /// Latest release on the given track
    ///
    /// Stable resolves the host's "latest" (non-prerelease) endpoint; Latest
    /// takes the newest listed release, prereleases included.
    pub async fn get_latest(&self, repository: &str, track: UpdateTrack) -> Result<Release> {
        let release = match track {
            UpdateTrack::Stable => {
                let url = format!("{}/repos/{}/releases/latest", self.base_url, repository);
                debug!("Fetching latest stable release from {}", url);
                let response = self.client.get(&url).send().await?;
                if !response.status().is_success() {
                    return Err(anyhow!("Failed to fetch release: {}", response.status()));
                }
                response.json::<Release>().await?
            }
            UpdateTrack::Latest => {
                let url = format!("{}/repos/{}/releases?per_page=10", self.base_url, repository);
                debug!("Fetching release list from {}", url);
                let response = self.client.get(&url).send().await?;
                if !response.status().is_success() {
                    return Err(anyhow!("Failed to list releases: {}", response.status()));
                }
                let releases: Vec<Release> = response.json().await?;
                releases
                    .into_iter()
                    .find(|r| !r.draft)
                    .ok_or_else(|| anyhow!("No releases published"))?
            }
        };

        release.validate()?;
        Ok(release)
    }

    /// Recent releases, drafts excluded, newest first
    pub async fn list_releases(&self, repository: &str, per_page: usize) -> Result<Vec<Release>> {
        let url = format!(
            "{}/repos/{}/releases?per_page={}",
            self.base_url, repository, per_page
        );
        debug!("Fetching release list from {}", url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Failed to list releases: {}", response.status()));
        }
        let releases: Vec<Release> = response.json().await?;
        let releases: Vec<Release> = releases.into_iter().filter(|r| !r.draft).collect();
        for release in &releases {
            release.validate()?;
        }
        Ok(releases)
    }

    /// Release by tag
    pub async fn get_release(&self, repository: &str, tag: &str) -> Result<Release> {
        let url = format!(
            "{}/repos/{}/releases/tags/{}",
            self.base_url, repository, tag
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Release {} not found", tag));
        }
        let release: Release = response.json().await?;
        release.validate()?;
        Ok(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(tag: &str) -> Release {
        Release {
            tag_name: tag.to_string(),
            name: None,
            body: None,
            prerelease: false,
            draft: false,
            assets: Vec::new(),
            published_at: None,
        }
    }

    #[test]
    fn test_validate_accepts_plain_tag() {
        assert!(release("v1.2.0").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_tag() {
        assert!(release("  ").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_path_separators() {
        assert!(release("../../etc").validate().is_err());

        let mut r = release("v1.0.0");
        r.assets.push(ReleaseAsset {
            name: "../escape.tar.gz".to_string(),
            browser_download_url: "https://example.com/a".to_string(),
            size: 1,
        });
        assert!(r.validate().is_err());
    }
}
