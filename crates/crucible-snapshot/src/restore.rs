//! Two-phase snapshot restore
//!
//! Phase one reconciles extensions item by item; a single extension
//! failure is counted, not fatal. Phase two reconciles the active
//! environment's packages behind a safety archive: any phase-two failure
//! rolls the package tree back to its pre-restore state.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{info, warn};

use crucible_core::proc::run_logged;
use crucible_core::types::InstallationPatch;
use crucible_core::{CancelToken, OutputSink};
use crucible_env::EnvManager;

use crate::snapshot::{
    ExtensionState, PackageSpec, Snapshot, SnapshotService, SnapshotTrigger, DISABLED_SUFFIX,
};

/// Per-phase reconciliation counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    /// Items added that the snapshot has but the installation lacked
    pub installed: usize,
    /// Items whose state was adjusted in place
    pub changed: usize,
    /// Items removed that the snapshot does not know about
    pub removed: usize,
    /// Items that could not be reconciled
    pub failed: usize,
}

/// Outcome of a restore
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RestoreSummary {
    pub extensions: PhaseCounts,
    pub packages: PhaseCounts,
    /// True when the package phase failed and the pre-restore package tree
    /// was put back from the safety archive
    pub reverted: bool,
}

const SAFETY_ARCHIVE: &str = ".restore-safety.tar.gz";

impl SnapshotService {
    /// Restore the installation to a previously saved snapshot
    ///
    /// On success the record's rollback marker is updated and a fresh
    /// snapshot of the restored state is taken, so the restore point itself
    /// becomes the newest entry in the list.
    pub async fn restore(
        &self,
        filename: &str,
        output: &OutputSink,
        cancel: &CancelToken,
    ) -> Result<RestoreSummary> {
        let snapshot = self.load(filename).await?;
        info!(
            "Restoring {} to snapshot {}",
            self.installation_id(),
            filename
        );

        let extensions = self
            .restore_extensions(&snapshot, output, cancel)
            .await?;

        let (packages, reverted) = self.restore_packages(&snapshot, output, cancel).await?;

        if reverted {
            warn!("Package phase failed; package tree reverted");
            return Ok(RestoreSummary {
                extensions,
                packages,
                reverted: true,
            });
        }

        self.store()
            .update(
                self.installation_id(),
                InstallationPatch {
                    last_rollback: Some(Some(filename.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        self.save(SnapshotTrigger::Restart, None).await?;

        Ok(RestoreSummary {
            extensions,
            packages,
            reverted: false,
        })
    }

    /// Phase one: reconcile extensions against the snapshot
    async fn restore_extensions(
        &self,
        snapshot: &Snapshot,
        output: &OutputSink,
        cancel: &CancelToken,
    ) -> Result<PhaseCounts> {
        let dir = self.extensions_dir();
        fs::create_dir_all(&dir)?;

        let current: HashMap<String, ExtensionState> = self
            .scan_extensions()?
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        let mut counts = PhaseCounts::default();

        for wanted in &snapshot.extensions {
            cancel.err_if_cancelled()?;
            match current.get(&wanted.name) {
                Some(present) if present.enabled == wanted.enabled => {}
                Some(_) => {
                    if let Err(err) = toggle_extension(&dir, &wanted.name, wanted.enabled) {
                        warn!("Could not toggle extension {}: {}", wanted.name, err);
                        output.line(format!("! {}: {}", wanted.name, err));
                        counts.failed += 1;
                    } else {
                        output.line(format!(
                            "~ {} {}",
                            wanted.name,
                            if wanted.enabled { "enabled" } else { "disabled" }
                        ));
                        counts.changed += 1;
                    }
                }
                None => match self
                    .install_extension(wanted, &dir, output, cancel)
                    .await
                {
                    Ok(()) => {
                        output.line(format!("+ {}", wanted.name));
                        counts.installed += 1;
                    }
                    Err(err) if is_cancelled(&err) => return Err(err),
                    Err(err) => {
                        warn!("Could not install extension {}: {}", wanted.name, err);
                        output.line(format!("! {}: {}", wanted.name, err));
                        counts.failed += 1;
                    }
                },
            }
        }

        let wanted_names: Vec<&str> = snapshot.extensions.iter().map(|e| e.name.as_str()).collect();
        for (name, present) in &current {
            cancel.err_if_cancelled()?;
            if wanted_names.contains(&name.as_str()) {
                continue;
            }
            let path = extension_path(&dir, name, present.enabled);
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    output.line(format!("- {}", name));
                    counts.removed += 1;
                }
                Err(err) => {
                    warn!("Could not remove extension {}: {}", name, err);
                    counts.failed += 1;
                }
            }
        }

        Ok(counts)
    }

    /// Clone a missing extension from its recorded origin
    async fn install_extension(
        &self,
        wanted: &ExtensionState,
        dir: &Path,
        output: &OutputSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        let url = wanted
            .repo_url
            .as_deref()
            .ok_or_else(|| anyhow!("no recorded origin to reinstall from"))?;
        let target = extension_path(dir, &wanted.name, wanted.enabled);
        let target_str = target.to_string_lossy().to_string();
        run_logged("git", &["clone", url, &target_str], dir, output, cancel).await?;
        Ok(())
    }

    /// Phase two: reconcile the active environment's packages
    ///
    /// Returns the counts plus whether a failure forced a revert.
    async fn restore_packages(
        &self,
        snapshot: &Snapshot,
        output: &OutputSink,
        cancel: &CancelToken,
    ) -> Result<(PhaseCounts, bool)> {
        let record = self.store().get(self.installation_id()).await?;
        let envs = EnvManager::new(self.install_path());
        let Some(active) = envs.resolve_active(&record) else {
            // No environment to reconcile; the extension phase stands alone.
            return Ok((PhaseCounts::default(), false));
        };

        let current: HashMap<String, String> = self
            .scan_packages(&record)?
            .into_iter()
            .map(|p| (p.name, p.version))
            .collect();
        let wanted: HashMap<&str, &str> = snapshot
            .packages
            .iter()
            .map(|p| (p.name.as_str(), p.version.as_str()))
            .collect();

        let to_install: Vec<&PackageSpec> = snapshot
            .packages
            .iter()
            .filter(|p| current.get(&p.name).map(String::as_str) != Some(p.version.as_str()))
            .collect();
        let to_remove: Vec<&str> = current
            .keys()
            .filter(|name| !wanted.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();

        let mut counts = PhaseCounts::default();
        if to_install.is_empty() && to_remove.is_empty() {
            return Ok((counts, false));
        }

        let packages_dir = envs.packages_dir(&active);
        let safety = self.snapshots_dir().join(SAFETY_ARCHIVE);
        {
            let tree = packages_dir.clone();
            let archive = safety.clone();
            tokio::task::spawn_blocking(move || archive_tree(&tree, &archive))
                .await
                .context("Safety archive task panicked")?
                .context("Failed to archive package tree before restore")?;
        }

        let python = envs.python_path(&active);
        let python_str = python.to_string_lossy().to_string();

        let result: Result<()> = async {
            for name in &to_remove {
                cancel.err_if_cancelled()?;
                run_logged(
                    &python_str,
                    &["-m", "pip", "uninstall", "-y", name],
                    self.install_path(),
                    output,
                    cancel,
                )
                .await?;
                counts.removed += 1;
            }
            for spec in &to_install {
                cancel.err_if_cancelled()?;
                let requirement = format!("{}=={}", spec.name, spec.version);
                run_logged(
                    &python_str,
                    &["-m", "pip", "install", &requirement],
                    self.install_path(),
                    output,
                    cancel,
                )
                .await?;
                if current.contains_key(&spec.name) {
                    counts.changed += 1;
                } else {
                    counts.installed += 1;
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let _ = fs::remove_file(&safety);
                Ok((counts, false))
            }
            Err(err) => {
                warn!("Package reconciliation failed: {}", err);
                let tree = packages_dir.clone();
                let archive = safety.clone();
                tokio::task::spawn_blocking(move || revert_tree(&tree, &archive))
                    .await
                    .context("Safety revert task panicked")?
                    .context("Failed to revert package tree from safety archive")?;
                let _ = fs::remove_file(&safety);
                if is_cancelled(&err) {
                    return Err(err);
                }
                counts.failed += 1;
                Ok((counts, true))
            }
        }
    }
}

/// Whether an error chain bottoms out in a user cancellation
fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<crucible_core::Error>()
        .is_some_and(crucible_core::Error::is_cancelled)
}

fn extension_path(dir: &Path, name: &str, enabled: bool) -> std::path::PathBuf {
    if enabled {
        dir.join(name)
    } else {
        dir.join(format!("{}{}", name, DISABLED_SUFFIX))
    }
}

/// Flip an extension between enabled and disabled by renaming its directory
fn toggle_extension(dir: &Path, name: &str, enable: bool) -> Result<()> {
    let from = extension_path(dir, name, !enable);
    let to = extension_path(dir, name, enable);
    fs::rename(&from, &to).with_context(|| format!("Failed to rename {}", from.display()))?;
    Ok(())
}

/// Pack a directory tree into a gzipped tar at `archive`
fn archive_tree(tree: &Path, archive: &Path) -> Result<()> {
    let file = File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    if tree.is_dir() {
        builder.append_dir_all(".", tree)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Replace a directory tree with the contents of a gzipped tar
fn revert_tree(tree: &Path, archive: &Path) -> Result<()> {
    if tree.exists() {
        fs::remove_dir_all(tree)?;
    }
    fs::create_dir_all(tree)?;
    let file = File::open(archive)?;
    let mut unpacker = tar::Archive::new(GzDecoder::new(file));
    unpacker.unpack(tree)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::fixture;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_restore_toggles_and_removes_extensions() {
        let dir = TempDir::new().unwrap();
        let (_, service) = fixture(&dir).await;
        let ext_dir = service.extensions_dir();

        // Snapshot state: "keeper" enabled
        fs::create_dir_all(ext_dir.join("keeper")).unwrap();
        let filename = service
            .save(SnapshotTrigger::Manual, None)
            .await
            .unwrap();

        // Drift: keeper got disabled, an interloper appeared
        fs::rename(ext_dir.join("keeper"), ext_dir.join("keeper.disabled")).unwrap();
        fs::create_dir_all(ext_dir.join("interloper")).unwrap();

        let summary = service
            .restore(&filename, &OutputSink::discard(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(summary.extensions.changed, 1);
        assert_eq!(summary.extensions.removed, 1);
        assert_eq!(summary.extensions.failed, 0);
        assert!(!summary.reverted);
        assert!(ext_dir.join("keeper").is_dir());
        assert!(!ext_dir.join("keeper.disabled").exists());
        assert!(!ext_dir.join("interloper").exists());
    }

    #[tokio::test]
    async fn test_restore_takes_fresh_snapshot_and_marks_rollback() {
        let dir = TempDir::new().unwrap();
        let (record, service) = fixture(&dir).await;

        let filename = service.save(SnapshotTrigger::Boot, None).await.unwrap();
        service
            .restore(&filename, &OutputSink::discard(), &CancelToken::new())
            .await
            .unwrap();

        // The restore point is now the newest entry
        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].snapshot.trigger, SnapshotTrigger::Restart);

        let reloaded = service.store().get(&record.id).await.unwrap();
        assert_eq!(reloaded.last_rollback.as_deref(), Some(filename.as_str()));
        assert_eq!(
            reloaded.last_snapshot.as_deref(),
            Some(listed[0].filename.as_str())
        );
    }

    #[tokio::test]
    async fn test_missing_extension_without_origin_counts_as_failed() {
        let dir = TempDir::new().unwrap();
        let (_, service) = fixture(&dir).await;
        let ext_dir = service.extensions_dir();

        fs::create_dir_all(ext_dir.join("untracked")).unwrap();
        let filename = service
            .save(SnapshotTrigger::Manual, None)
            .await
            .unwrap();
        fs::remove_dir_all(ext_dir.join("untracked")).unwrap();

        let summary = service
            .restore(&filename, &OutputSink::discard(), &CancelToken::new())
            .await
            .unwrap();

        // No .git/config was present at capture, so there is no origin to
        // reinstall from.
        assert_eq!(summary.extensions.failed, 1);
        assert_eq!(summary.extensions.installed, 0);
    }

    #[tokio::test]
    async fn test_failed_package_phase_reverts_tree() {
        let dir = TempDir::new().unwrap();
        let (record, service) = fixture(&dir).await;

        // An active environment with one package, but no interpreter, so any
        // pip invocation fails.
        let envs = EnvManager::new(service.install_path());
        let packages = envs.packages_dir("main");
        fs::create_dir_all(&packages).unwrap();
        fs::create_dir_all(packages.join("requests-2.32.0")).unwrap();

        let filename = service.save(SnapshotTrigger::Manual, None).await.unwrap();

        // Drift the package tree so the diff is non-empty
        fs::rename(
            packages.join("requests-2.32.0"),
            packages.join("requests-2.99.0"),
        )
        .unwrap();

        let summary = service
            .restore(&filename, &OutputSink::discard(), &CancelToken::new())
            .await
            .unwrap();

        assert!(summary.reverted);
        assert_eq!(summary.packages.failed, 1);
        // Pre-restore tree is back
        assert!(packages.join("requests-2.99.0").is_dir());
        assert!(!packages.join("requests-2.32.0").exists());
        // No fresh snapshot and no rollback marker after a revert
        assert_eq!(service.list().await.unwrap().len(), 1);
        let reloaded = service.store().get(&record.id).await.unwrap();
        assert!(reloaded.last_rollback.is_none());
    }

    #[test]
    fn test_archive_and_revert_round_trip() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("nested")).unwrap();
        fs::write(tree.join("nested").join("file"), b"payload").unwrap();

        let archive = dir.path().join("safety.tar.gz");
        archive_tree(&tree, &archive).unwrap();

        fs::remove_dir_all(&tree).unwrap();
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("junk"), b"drift").unwrap();

        revert_tree(&tree, &archive).unwrap();
        assert_eq!(
            fs::read(tree.join("nested").join("file")).unwrap(),
            b"payload"
        );
        assert!(!tree.join("junk").exists());
    }
}
