//! Durable CRUD over installation records
//!
//! The engine reads and writes through the `InstallationStore` trait and
//! never assumes the underlying format beyond the JSON implementation here.
//! Writes go through a temp-file rename under an advisory file lock so a
//! crashed writer never leaves a half-written document.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use fs4::fs_std::FileExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{InstallStatus, Installation, InstallationPatch};

/// Keyed persistence for installation records
#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// All records in display order
    async fn list(&self) -> Result<Vec<Installation>>;

    /// One record by id
    async fn get(&self, id: &str) -> Result<Installation>;

    /// Create a record from a fragment; assigns id and creation time
    async fn create(&self, fragment: InstallationPatch) -> Result<Installation>;

    /// Apply a partial update, merge-by-key
    async fn update(&self, id: &str, patch: InstallationPatch) -> Result<Installation>;

    /// Remove a record
    async fn remove(&self, id: &str) -> Result<()>;

    /// Reorder records; ids not mentioned keep their relative order at the tail
    async fn reorder(&self, ids: &[String]) -> Result<()>;
}

/// JSON-file-backed installation store
pub struct JsonInstallationStore {
    path: PathBuf,
    // Serializes in-process read-modify-write cycles; the file lock guards
    // against other processes.
    guard: Mutex<()>,
}

impl JsonInstallationStore {
    /// Create a store over the given JSON document path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<Installation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, records: &[Installation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(records)?)?;
        fs::rename(&tmp_path, &self.path)?;

        // Lock released when lock_file drops
        debug!("Persisted {} installation records", records.len());
        Ok(())
    }
}

#[async_trait]
impl InstallationStore for JsonInstallationStore {
    async fn list(&self) -> Result<Vec<Installation>> {
        let _guard = self.guard.lock().await;
        self.load()
    }

    async fn get(&self, id: &str) -> Result<Installation> {
        let _guard = self.guard.lock().await;
        self.load()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::installation_not_found(id))
    }

    async fn create(&self, fragment: InstallationPatch) -> Result<Installation> {
        let source_id = fragment
            .source_id
            .clone()
            .ok_or_else(|| Error::missing_field("source_id"))?;

        let mut record = Installation {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            name: "New installation".to_string(),
            status: InstallStatus::Pending,
            install_path: PathBuf::new(),
            source_id,
            version: None,
            variant: None,
            download_files: Vec::new(),
            python_version: None,
            launch_args: Vec::new(),
            browser_partition: None,
            active_env: None,
            update_track: Default::default(),
            update_info: Default::default(),
            last_snapshot: None,
            snapshot_count: 0,
            last_rollback: None,
            extra: serde_json::Map::new(),
        };
        record.apply(fragment);

        let _guard = self.guard.lock().await;
        let mut records = self.load()?;
        records.push(record.clone());
        self.save(&records)?;
        Ok(record)
    }

    async fn update(&self, id: &str, patch: InstallationPatch) -> Result<Installation> {
        let _guard = self.guard.lock().await;
        let mut records = self.load()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::installation_not_found(id))?;
        record.apply(patch);
        let updated = record.clone();
        self.save(&records)?;
        Ok(updated)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(Error::installation_not_found(id));
        }
        self.save(&records)
    }

    async fn reorder(&self, ids: &[String]) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut records = self.load()?;
        let mut ordered = Vec::with_capacity(records.len());
        for id in ids {
            if let Some(pos) = records.iter().position(|r| &r.id == id) {
                ordered.push(records.remove(pos));
            }
        }
        // Unknown ids in `ids` are ignored; unmentioned records keep their
        // relative order at the tail.
        ordered.append(&mut records);
        self.save(&ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> JsonInstallationStore {
        JsonInstallationStore::new(dir.path().join("installations.json"))
    }

    fn fragment(name: &str) -> InstallationPatch {
        InstallationPatch {
            source_id: Some("standalone".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let record = store.create(fragment("Main")).await.unwrap();
        assert!(!record.id.is_empty());
        assert_eq!(record.name, "Main");
        assert_eq!(record.status, InstallStatus::Pending);
        assert_eq!(record.source_id, "standalone");
    }

    #[tokio::test]
    async fn test_create_without_source_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let err = store.create(InstallationPatch::default()).await.unwrap_err();
        assert!(matches!(err, Error::MissingField { .. }));
    }

    #[tokio::test]
    async fn test_update_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let record = store.create(fragment("Main")).await.unwrap();
        store
            .update(&record.id, InstallationPatch::status(InstallStatus::Installed))
            .await
            .unwrap();

        let reloaded = store.get(&record.id).await.unwrap();
        assert_eq!(reloaded.status, InstallStatus::Installed);
        assert_eq!(reloaded.name, "Main");
    }

    #[tokio::test]
    async fn test_remove_unknown_id_errors() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let err = store.remove("nope").await.unwrap_err();
        assert!(matches!(err, Error::InstallationNotFound { .. }));
    }

    #[tokio::test]
    async fn test_reorder_keeps_unmentioned_at_tail() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let a = store.create(fragment("A")).await.unwrap();
        let b = store.create(fragment("B")).await.unwrap();
        let c = store.create(fragment("C")).await.unwrap();

        store.reorder(&[c.id.clone(), a.id.clone()]).await.unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["C", "A", "B"]);
        let _ = b;
    }

    #[tokio::test]
    async fn test_unknown_keys_survive_update() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut frag = fragment("Forward");
        frag.extra
            .insert("future_key".to_string(), serde_json::json!("kept"));
        let record = store.create(frag).await.unwrap();

        store
            .update(&record.id, InstallationPatch::status(InstallStatus::Failed))
            .await
            .unwrap();

        let reloaded = store.get(&record.id).await.unwrap();
        assert_eq!(reloaded.extra["future_key"], serde_json::json!("kept"));
    }
}
