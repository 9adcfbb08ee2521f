//! Snapshot capture, listing, and deletion

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crucible_core::types::{Installation, InstallationPatch};
use crucible_core::utils::compact_timestamp;
use crucible_core::InstallationStore;
use crucible_env::EnvManager;

/// What caused a snapshot to be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotTrigger {
    /// First successful install
    Boot,
    /// User-requested
    Manual,
    /// Taken after a successful restore
    Restart,
    /// Taken automatically before a destructive update step
    PreUpdate,
}

impl SnapshotTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Manual => "manual",
            Self::Restart => "restart",
            Self::PreUpdate => "pre-update",
        }
    }
}

/// State of one installed third-party extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionState {
    /// Extension directory name
    pub name: String,

    /// Whether the extension is enabled
    pub enabled: bool,

    /// Origin repository, when the extension is a git checkout
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub repo_url: Option<String>,
}

/// One pinned package of the active environment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
}

/// Immutable point-in-time capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,

    /// What caused it
    pub trigger: SnapshotTrigger,

    /// Optional user label
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,

    /// Installed third-party extensions at capture time
    pub extensions: Vec<ExtensionState>,

    /// Exact package set of the active environment at capture time
    pub packages: Vec<PackageSpec>,
}

/// A listed snapshot with its on-disk filename
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub filename: String,
    pub snapshot: Snapshot,
}

/// Suffix marking a disabled extension directory
pub const DISABLED_SUFFIX: &str = ".disabled";

/// Snapshot operations for one installation
pub struct SnapshotService {
    installation_id: String,
    install_path: PathBuf,
    store: Arc<dyn InstallationStore>,
}

impl SnapshotService {
    /// Service for the given installation record
    pub fn new(installation: &Installation, store: Arc<dyn InstallationStore>) -> Self {
        Self {
            installation_id: installation.id.clone(),
            install_path: installation.install_path.clone(),
            store,
        }
    }

    /// Directory holding this installation's snapshot files
    pub fn snapshots_dir(&self) -> PathBuf {
        self.install_path.join("snapshots")
    }

    /// Directory holding this installation's third-party extensions
    pub fn extensions_dir(&self) -> PathBuf {
        self.install_path.join("app").join("extensions")
    }

    pub(crate) fn installation_id(&self) -> &str {
        &self.installation_id
    }

    pub(crate) fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub(crate) fn store(&self) -> &Arc<dyn InstallationStore> {
        &self.store
    }

    /// Capture current state and persist it; returns the snapshot filename
    ///
    /// The file is written to a temporary path and renamed, so a snapshot
    /// only exists once it has fully landed.
    pub async fn save(
        &self,
        trigger: SnapshotTrigger,
        label: Option<String>,
    ) -> Result<String> {
        let record = self.store.get(&self.installation_id).await?;
        let snapshot = Snapshot {
            created_at: Utc::now(),
            trigger,
            label,
            extensions: self.scan_extensions()?,
            packages: self.scan_packages(&record)?,
        };

        let dir = self.snapshots_dir();
        fs::create_dir_all(&dir)?;

        let mut filename = format!(
            "{}-{}.json",
            compact_timestamp(snapshot.created_at),
            trigger.as_str()
        );
        let mut counter = 1;
        while dir.join(&filename).exists() {
            filename = format!(
                "{}-{}-{}.json",
                compact_timestamp(snapshot.created_at),
                trigger.as_str(),
                counter
            );
            counter += 1;
        }

        let tmp = dir.join(format!("{}.tmp", filename));
        fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        fs::rename(&tmp, dir.join(&filename))?;

        self.store
            .update(
                &self.installation_id,
                InstallationPatch {
                    last_snapshot: Some(Some(filename.clone())),
                    snapshot_count: Some(record.snapshot_count + 1),
                    ..Default::default()
                },
            )
            .await?;

        info!("Snapshot saved: {} ({})", filename, trigger.as_str());
        Ok(filename)
    }

    /// All snapshots, newest first
    pub async fn list(&self) -> Result<Vec<SnapshotEntry>> {
        let dir = self.snapshots_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") {
                continue;
            }
            let content = fs::read_to_string(entry.path())?;
            match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => entries.push(SnapshotEntry {
                    filename: name,
                    snapshot,
                }),
                Err(err) => debug!("Skipping unreadable snapshot {}: {}", name, err),
            }
        }

        entries.sort_by(|a, b| b.snapshot.created_at.cmp(&a.snapshot.created_at));
        Ok(entries)
    }

    /// Load one snapshot by filename
    pub async fn load(&self, filename: &str) -> Result<Snapshot> {
        let path = self.snapshots_dir().join(filename);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Snapshot not found: {}", filename))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Delete a snapshot
    ///
    /// When the deleted snapshot is the record's `last_snapshot`, the
    /// pointer moves to the newest survivor, or clears if none remain.
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let path = self.snapshots_dir().join(filename);
        if !path.is_file() {
            return Err(anyhow!("Snapshot not found: {}", filename));
        }
        fs::remove_file(&path)?;

        let record = self.store.get(&self.installation_id).await?;
        if record.last_snapshot.as_deref() == Some(filename) {
            let survivor = self.list().await?.into_iter().next().map(|e| e.filename);
            self.store
                .update(
                    &self.installation_id,
                    InstallationPatch {
                        last_snapshot: Some(survivor),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Scan installed third-party extensions
    pub(crate) fn scan_extensions(&self) -> Result<Vec<ExtensionState>> {
        let dir = self.extensions_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut extensions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let raw = entry.file_name().to_string_lossy().to_string();
            let (name, enabled) = match raw.strip_suffix(DISABLED_SUFFIX) {
                Some(base) => (base.to_string(), false),
                None => (raw, true),
            };
            let repo_url = read_origin_url(&entry.path());
            extensions.push(ExtensionState {
                name,
                enabled,
                repo_url,
            });
        }
        extensions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(extensions)
    }

    /// Scan the exact package set of the active environment
    pub(crate) fn scan_packages(&self, record: &Installation) -> Result<Vec<PackageSpec>> {
        let envs = EnvManager::new(&self.install_path);
        let Some(active) = envs.resolve_active(record) else {
            return Ok(Vec::new());
        };

        let packages_dir = envs.packages_dir(&active);
        if !packages_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut packages = Vec::new();
        for entry in fs::read_dir(&packages_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(spec) = parse_package_entry(&name) {
                packages.push(spec);
            }
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }
}

/// Parse a `name-version` package directory entry
pub(crate) fn parse_package_entry(entry: &str) -> Option<PackageSpec> {
    let (name, version) = entry.rsplit_once('-')?;
    if name.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(PackageSpec {
        name: name.to_string(),
        version: version.to_string(),
    })
}

/// Best-effort read of a git checkout's origin URL
fn read_origin_url(extension_dir: &Path) -> Option<String> {
    let config = fs::read_to_string(extension_dir.join(".git").join("config")).ok()?;
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == r#"[remote "origin"]"#;
            continue;
        }
        if in_origin {
            if let Some(url) = line.strip_prefix("url = ") {
                return Some(url.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crucible_core::JsonInstallationStore;
    use tempfile::TempDir;

    pub(crate) async fn fixture(dir: &TempDir) -> (Installation, SnapshotService) {
        let store = Arc::new(JsonInstallationStore::new(dir.path().join("store.json")));
        let record = store
            .create(InstallationPatch {
                source_id: Some("standalone".to_string()),
                name: Some("Snap test".to_string()),
                install_path: Some(dir.path().join("install")),
                ..Default::default()
            })
            .await
            .unwrap();
        let service = SnapshotService::new(&record, store);
        fs::create_dir_all(service.extensions_dir()).unwrap();
        (record, service)
    }

    #[tokio::test]
    async fn test_save_and_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let (_, service) = fixture(&dir).await;

        let first = service.save(SnapshotTrigger::Boot, None).await.unwrap();
        let second = service
            .save(SnapshotTrigger::Manual, Some("before experiment".to_string()))
            .await
            .unwrap();

        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].filename, second);
        assert_eq!(listed[1].filename, first);
        assert!(listed[0].snapshot.created_at >= listed[1].snapshot.created_at);
    }

    #[tokio::test]
    async fn test_save_updates_record_pointers() {
        let dir = TempDir::new().unwrap();
        let (record, service) = fixture(&dir).await;

        let filename = service.save(SnapshotTrigger::Boot, None).await.unwrap();

        let reloaded = service.store().get(&record.id).await.unwrap();
        assert_eq!(reloaded.last_snapshot.as_deref(), Some(filename.as_str()));
        assert_eq!(reloaded.snapshot_count, 1);
    }

    #[tokio::test]
    async fn test_delete_repoints_last_snapshot() {
        let dir = TempDir::new().unwrap();
        let (record, service) = fixture(&dir).await;

        let older = service.save(SnapshotTrigger::Boot, None).await.unwrap();
        let newest = service.save(SnapshotTrigger::Manual, None).await.unwrap();

        service.delete(&newest).await.unwrap();
        let reloaded = service.store().get(&record.id).await.unwrap();
        assert_eq!(reloaded.last_snapshot.as_deref(), Some(older.as_str()));

        service.delete(&older).await.unwrap();
        let reloaded = service.store().get(&record.id).await.unwrap();
        assert!(reloaded.last_snapshot.is_none());
    }

    #[tokio::test]
    async fn test_capture_includes_disabled_extensions() {
        let dir = TempDir::new().unwrap();
        let (_, service) = fixture(&dir).await;

        fs::create_dir_all(service.extensions_dir().join("manager")).unwrap();
        fs::create_dir_all(service.extensions_dir().join("legacy.disabled")).unwrap();

        let filename = service.save(SnapshotTrigger::Manual, None).await.unwrap();
        let snapshot = service.load(&filename).await.unwrap();

        assert_eq!(snapshot.extensions.len(), 2);
        let legacy = snapshot
            .extensions
            .iter()
            .find(|e| e.name == "legacy")
            .unwrap();
        assert!(!legacy.enabled);
        let manager = snapshot
            .extensions
            .iter()
            .find(|e| e.name == "manager")
            .unwrap();
        assert!(manager.enabled);
    }

    #[test]
    fn test_parse_package_entry() {
        let spec = parse_package_entry("requests-2.32.0").unwrap();
        assert_eq!(spec.name, "requests");
        assert_eq!(spec.version, "2.32.0");

        // Hyphenated names split at the version boundary
        let spec = parse_package_entry("typing-extensions-4.12.2").unwrap();
        assert_eq!(spec.name, "typing-extensions");

        assert!(parse_package_entry("noversion").is_none());
        assert!(parse_package_entry("trailing-").is_none());
    }

    #[test]
    fn test_trigger_serializes_kebab_case() {
        let json = serde_json::to_string(&SnapshotTrigger::PreUpdate).unwrap();
        assert_eq!(json, r#""pre-update""#);
    }
}
