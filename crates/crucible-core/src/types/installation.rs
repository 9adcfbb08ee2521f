//! Installation record and patch-merge primitives
//!
//! An installation is one self-contained, independently launchable bundle
//! instance. The record carries typed fields for everything the engine
//! understands, plus a flattened side-map so keys written by a newer build
//! survive a read/write round-trip through an older one.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Installation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStatus {
    /// Record created, install not yet completed
    Pending,
    /// Fully installed and launchable
    Installed,
    /// Install or update failed
    Failed,
    /// Removal started but did not complete
    PartialDelete,
}

/// Update channel an installation independently follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateTrack {
    /// Tagged stable releases only
    Stable,
    /// Newest release, prereleases included
    Latest,
}

impl UpdateTrack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Latest => "latest",
        }
    }
}

impl Default for UpdateTrack {
    fn default() -> Self {
        Self::Stable
    }
}

/// One downloadable file of a release bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFile {
    /// Download URL
    pub url: String,

    /// Local filename
    pub filename: String,

    /// Expected size in bytes; 0 when unknown
    #[serde(default)]
    pub expected_size: u64,
}

/// Cached per-track update comparison for one installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Latest release tag on the track
    pub latest_tag: String,

    /// Release display name
    pub release_name: Option<String>,

    /// Release notes (changelog body)
    pub release_notes: Option<String>,

    /// When the release was published
    pub published_at: Option<DateTime<Utc>>,

    /// When the comparison was last refreshed
    pub checked_at: DateTime<Utc>,

    /// Whether the latest tag differs from this installation's installed marker
    pub update_available: bool,
}

/// Resolved command line for launching an installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Program to execute
    pub program: PathBuf,

    /// Arguments
    pub args: Vec<String>,

    /// Working directory
    pub cwd: PathBuf,

    /// Port the application will listen on, if any
    pub port: Option<u16>,
}

/// Installation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    /// Immutable identifier, generated at creation
    pub id: String,

    /// Creation timestamp, immutable
    pub created_at: DateTime<Utc>,

    /// Display name
    pub name: String,

    /// Lifecycle status
    pub status: InstallStatus,

    /// Root directory of the installation
    pub install_path: PathBuf,

    /// Owning source plugin; set once, never changed
    pub source_id: String,

    /// Installed release tag (e.g. "v1.2.0")
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,

    /// Hardware/platform variant (e.g. "linux-nvidia-cu128")
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,

    /// Files the bundle was (or will be) downloaded from
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub download_files: Vec<DownloadFile>,

    /// Runtime interpreter version
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub python_version: Option<String>,

    /// Extra launch arguments
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub launch_args: Vec<String>,

    /// Browser partition for hosted variants
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub browser_partition: Option<String>,

    /// Name of the active environment, if one has been selected
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active_env: Option<String>,

    /// Update channel this installation follows
    #[serde(default)]
    pub update_track: UpdateTrack,

    /// Last update comparison, keyed by track name
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub update_info: HashMap<String, UpdateInfo>,

    /// Filename of the most recent snapshot
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_snapshot: Option<String>,

    /// Number of snapshots taken over the installation's lifetime
    #[serde(default)]
    pub snapshot_count: u64,

    /// Filename of the snapshot most recently restored
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_rollback: Option<String>,

    /// Unknown attributes, preserved verbatim across round-trips
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Partial installation update, merged by key
///
/// Clearable optional fields use a double `Option`: the outer level is
/// "present in the patch", the inner is the new value (`None` clears).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationPatch {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<InstallStatus>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub install_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub download_files: Option<Vec<DownloadFile>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub python_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub launch_args: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub browser_partition: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active_env: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_track: Option<UpdateTrack>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_info: Option<HashMap<String, UpdateInfo>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_snapshot: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub snapshot_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_rollback: Option<Option<String>>,

    /// Extra keys merged into the record's side-map; never drops unrelated keys
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Installation {
    /// Apply a patch, merging by key
    ///
    /// `id`, `created_at`, and `source_id` are immutable and never touched.
    /// Patch `extra` keys overwrite same-named keys but leave the rest of the
    /// side-map intact.
    pub fn apply(&mut self, patch: InstallationPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(install_path) = patch.install_path {
            self.install_path = install_path;
        }
        if let Some(version) = patch.version {
            self.version = Some(version);
        }
        if let Some(variant) = patch.variant {
            self.variant = Some(variant);
        }
        if let Some(download_files) = patch.download_files {
            self.download_files = download_files;
        }
        if let Some(python_version) = patch.python_version {
            self.python_version = Some(python_version);
        }
        if let Some(launch_args) = patch.launch_args {
            self.launch_args = launch_args;
        }
        if let Some(browser_partition) = patch.browser_partition {
            self.browser_partition = Some(browser_partition);
        }
        if let Some(active_env) = patch.active_env {
            self.active_env = active_env;
        }
        if let Some(update_track) = patch.update_track {
            self.update_track = update_track;
        }
        if let Some(update_info) = patch.update_info {
            for (track, info) in update_info {
                self.update_info.insert(track, info);
            }
        }
        if let Some(last_snapshot) = patch.last_snapshot {
            self.last_snapshot = last_snapshot;
        }
        if let Some(snapshot_count) = patch.snapshot_count {
            self.snapshot_count = snapshot_count;
        }
        if let Some(last_rollback) = patch.last_rollback {
            self.last_rollback = last_rollback;
        }
        for (key, value) in patch.extra {
            self.extra.insert(key, value);
        }
    }
}

impl InstallationPatch {
    /// Patch setting only the status field
    pub fn status(status: InstallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Installation {
        Installation {
            id: "inst-1".to_string(),
            created_at: Utc::now(),
            name: "Main".to_string(),
            status: InstallStatus::Pending,
            install_path: PathBuf::from("/data/main"),
            source_id: "standalone".to_string(),
            version: Some("v1.2.0".to_string()),
            variant: Some("linux-nvidia-cu128".to_string()),
            download_files: Vec::new(),
            python_version: None,
            launch_args: Vec::new(),
            browser_partition: None,
            active_env: None,
            update_track: UpdateTrack::Stable,
            update_info: HashMap::new(),
            last_snapshot: None,
            snapshot_count: 0,
            last_rollback: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_apply_merges_known_fields() {
        let mut inst = sample();
        inst.apply(InstallationPatch {
            status: Some(InstallStatus::Installed),
            active_env: Some(Some("main".to_string())),
            snapshot_count: Some(1),
            ..Default::default()
        });

        assert_eq!(inst.status, InstallStatus::Installed);
        assert_eq!(inst.active_env.as_deref(), Some("main"));
        assert_eq!(inst.snapshot_count, 1);
        // Untouched fields survive
        assert_eq!(inst.version.as_deref(), Some("v1.2.0"));
    }

    #[test]
    fn test_apply_clears_double_option_fields() {
        let mut inst = sample();
        inst.last_snapshot = Some("20260101-000000-boot.json".to_string());

        inst.apply(InstallationPatch {
            last_snapshot: Some(None),
            ..Default::default()
        });

        assert!(inst.last_snapshot.is_none());
    }

    #[test]
    fn test_apply_merges_extra_without_dropping() {
        let mut inst = sample();
        inst.extra
            .insert("port".to_string(), serde_json::json!(8188));

        let mut patch = InstallationPatch::default();
        patch
            .extra
            .insert("theme".to_string(), serde_json::json!("dark"));
        inst.apply(patch);

        assert_eq!(inst.extra["port"], serde_json::json!(8188));
        assert_eq!(inst.extra["theme"], serde_json::json!("dark"));
    }

    #[test]
    fn test_unknown_keys_round_trip() {
        let json = serde_json::json!({
            "id": "inst-2",
            "created_at": "2026-01-01T00:00:00Z",
            "name": "Forward",
            "status": "installed",
            "install_path": "/data/forward",
            "source_id": "portable",
            "future_field": {"nested": true}
        });

        let inst: Installation = serde_json::from_value(json).unwrap();
        assert_eq!(inst.extra["future_field"]["nested"], serde_json::json!(true));

        let back = serde_json::to_value(&inst).unwrap();
        assert_eq!(back["future_field"]["nested"], serde_json::json!(true));
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&InstallStatus::PartialDelete).unwrap();
        assert_eq!(json, r#""partial-delete""#);
    }
}
