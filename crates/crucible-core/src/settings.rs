//! Engine settings supplied by the host application
//!
//! The settings collaborator owns persistence; the engine only consumes the
//! values. Shared-path directories are used by the migration engine and as
//! environment-manager defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default staleness window for cached release metadata (15 minutes)
pub const DEFAULT_RELEASE_CACHE_TTL_SECS: u64 = 15 * 60;

/// Policy for dependency conflicts reported by a dry-run during updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Log a warning and proceed with the real install
    Warn,
    /// Abort the update before any dependency is touched
    Block,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::Warn
    }
}

/// Values the host application supplies to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Shared model directory used when `use_shared_paths` is on
    pub shared_models_dir: PathBuf,

    /// Shared input directory
    pub shared_input_dir: PathBuf,

    /// Shared output directory
    pub shared_output_dir: PathBuf,

    /// Whether shared-path categories target the shared directories
    pub use_shared_paths: bool,

    /// Base URL of the releases host
    pub releases_base_url: String,

    /// Repository whose releases installations track
    pub releases_repository: String,

    /// Staleness window for cached release metadata, in seconds
    pub release_cache_ttl_secs: u64,

    /// What to do when an update's dependency dry-run reports conflicts
    pub update_conflict_policy: ConflictPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("app", "crucible", "crucible")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            shared_models_dir: data_dir.join("models"),
            shared_input_dir: data_dir.join("input"),
            shared_output_dir: data_dir.join("output"),
            use_shared_paths: false,
            releases_base_url: "https://api.github.com".to_string(),
            releases_repository: "comfyanonymous/ComfyUI".to_string(),
            release_cache_ttl_secs: DEFAULT_RELEASE_CACHE_TTL_SECS,
            update_conflict_policy: ConflictPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.use_shared_paths);
        assert_eq!(settings.update_conflict_policy, ConflictPolicy::Warn);
        assert_eq!(
            settings.release_cache_ttl_secs,
            DEFAULT_RELEASE_CACHE_TTL_SECS
        );
    }

    #[test]
    fn test_conflict_policy_round_trip() {
        let json = serde_json::to_string(&ConflictPolicy::Block).unwrap();
        assert_eq!(json, r#""block""#);
        let back: ConflictPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConflictPolicy::Block);
    }
}
