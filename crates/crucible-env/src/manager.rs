//! Master runtime creation, environment cloning, and launch-time resolution

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crucible_core::types::{Installation, ProgressReporter};
use crucible_core::CancelToken;

use crate::permissions;

/// Name of the master environment; never launched directly
pub const MASTER_ENV: &str = "master";

/// Progress phase name used by environment events
pub const PHASE_ENV: &str = "environment";

/// Package prefixes stripped from the master after the first clone
///
/// These are the GPU compute/compiler libraries that dominate disk usage.
/// Only named environments are ever launched, so the master does not need
/// them once at least one clone exists.
const BULKY_PACKAGE_PREFIXES: &[&str] = &[
    "nvidia", "cuda", "cublas", "cudnn", "cufft", "curand", "cusolver", "cusparse", "nccl",
    "triton",
];

/// Marker written into every environment directory
#[derive(Debug, Serialize, Deserialize)]
struct EnvMarker {
    python_version: String,
    created_at: chrono::DateTime<Utc>,
}

/// Manages the environments of one installation
#[derive(Debug, Clone)]
pub struct EnvManager {
    root: PathBuf,
}

impl EnvManager {
    /// Manager rooted at `<install_path>/envs`
    pub fn new(install_path: &Path) -> Self {
        Self {
            root: install_path.join("envs"),
        }
    }

    /// Directory of the master environment
    pub fn master_dir(&self) -> PathBuf {
        self.root.join(MASTER_ENV)
    }

    /// Directory of a named environment
    pub fn env_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Package tree of a named environment
    pub fn packages_dir(&self, name: &str) -> PathBuf {
        self.env_dir(name).join("packages")
    }

    /// Interpreter path inside a named environment
    pub fn python_path(&self, name: &str) -> PathBuf {
        if cfg!(windows) {
            self.env_dir(name).join("Scripts").join("python.exe")
        } else {
            self.env_dir(name).join("bin").join("python")
        }
    }

    /// Create the master runtime once per installation
    ///
    /// Runtime binaries shipped inside the extracted bundle (under
    /// `<app_dir>/runtime`) are moved into the master; the bundle tree stays
    /// the source of truth for application files only.
    pub async fn create_master(&self, python_version: &str, app_dir: &Path) -> Result<()> {
        let master = self.master_dir();
        if master.exists() {
            debug!("Master environment already exists at {}", master.display());
            return Ok(());
        }

        info!("Creating master environment at {}", master.display());
        fs::create_dir_all(master.join("bin"))?;
        fs::create_dir_all(master.join("packages"))?;

        let bundled_runtime = app_dir.join("runtime");
        if bundled_runtime.is_dir() {
            let bin = master.join("bin");
            tokio::task::spawn_blocking(move || copy_tree(&bundled_runtime, &bin))
                .await
                .context("Runtime copy task panicked")??;
        }

        let marker = EnvMarker {
            python_version: python_version.to_string(),
            created_at: Utc::now(),
        };
        fs::write(
            master.join("env.json"),
            serde_json::to_string_pretty(&marker)?,
        )?;
        Ok(())
    }

    /// Clone the master into a named environment, reporting copy progress
    ///
    /// Progress is files-copied/total with elapsed and ETA. After the first
    /// clone the master is stripped of its bulky packages.
    pub async fn clone_env(
        &self,
        name: &str,
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<()> {
        if name == MASTER_ENV {
            return Err(anyhow!("Cannot clone onto the master environment"));
        }
        let master = self.master_dir();
        if !master.is_dir() {
            return Err(anyhow!("Master environment does not exist"));
        }
        let dest = self.env_dir(name);
        if dest.exists() {
            return Err(anyhow!("Environment {} already exists", name));
        }

        let first_clone = self.list_envs()?.is_empty();

        // The walk and copy loop can move gigabytes; keep it off the runtime
        // threads.
        let result = {
            let master = master.clone();
            let dest = dest.clone();
            let name = name.to_string();
            let reporter = reporter.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let files: Vec<_> = WalkDir::new(&master)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .collect();
                let total = files.len();
                let started = Instant::now();

                info!("Cloning master into {} ({} files)", name, total);
                for (index, entry) in files.iter().enumerate() {
                    cancel.err_if_cancelled()?;
                    let rel = entry.path().strip_prefix(&master)?;
                    let target = dest.join(rel);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(entry.path(), &target).with_context(|| {
                        format!("Failed to copy {} into environment", rel.display())
                    })?;

                    let done = index + 1;
                    let elapsed = started.elapsed().as_secs_f64();
                    let eta = if done > 0 {
                        elapsed / done as f64 * (total - done) as f64
                    } else {
                        0.0
                    };
                    reporter.flat(
                        PHASE_ENV,
                        format!(
                            "{}/{} files, {:.0}s elapsed, ETA {:.0}s",
                            done, total, elapsed, eta
                        ),
                        done as f32 / total.max(1) as f32 * 100.0,
                    );
                }
                Ok(())
            })
            .await
            .context("Environment copy task panicked")?
        };

        if let Err(err) = result {
            // A half-copied environment is unusable; remove it so the retry
            // starts clean.
            let _ = fs::remove_dir_all(&dest);
            return Err(err);
        }

        permissions::fix_permissions(&dest).await?;

        if first_clone {
            self.strip_master()?;
        }
        Ok(())
    }

    /// Delete bulky package prefixes from the master's package tree
    ///
    /// The master is never launched directly, so once a named environment
    /// exists these bytes are pure overhead.
    pub fn strip_master(&self) -> Result<u64> {
        let packages = self.packages_dir(MASTER_ENV);
        if !packages.is_dir() {
            return Ok(0);
        }

        let mut removed = 0u64;
        for entry in fs::read_dir(&packages)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            if BULKY_PACKAGE_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
            {
                debug!("Stripping bulky package from master: {}", name);
                if entry.path().is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Stripped {} bulky package(s) from master", removed);
        }
        Ok(removed)
    }

    /// Named environments present on disk, master excluded
    pub fn list_envs(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut envs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name != MASTER_ENV {
                envs.push(name);
            }
        }
        envs.sort();
        Ok(envs)
    }

    /// Resolve the environment to launch with
    ///
    /// Prefers the record's explicitly active environment when it exists on
    /// disk, falls back to the first environment found, and yields None when
    /// none exist — the caller treats that as "not ready", not an error.
    pub fn resolve_active(&self, installation: &Installation) -> Option<String> {
        if let Some(active) = &installation.active_env {
            if self.env_dir(active).is_dir() {
                return Some(active.clone());
            }
            warn!(
                "Active environment {} missing on disk, falling back",
                active
            );
        }
        self.list_envs().ok()?.into_iter().next()
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::types::{InstallStatus, InstallationPatch};
    use tempfile::TempDir;

    fn installation_at(path: &Path, active_env: Option<&str>) -> Installation {
        let mut inst = Installation {
            id: "env-test".to_string(),
            created_at: Utc::now(),
            name: "Env test".to_string(),
            status: InstallStatus::Installed,
            install_path: path.to_path_buf(),
            source_id: "standalone".to_string(),
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
        inst.apply(InstallationPatch {
            active_env: Some(active_env.map(str::to_string)),
            ..Default::default()
        });
        inst
    }

    async fn seeded_manager(dir: &TempDir) -> EnvManager {
        let manager = EnvManager::new(dir.path());
        let app_dir = dir.path().join("app");
        fs::create_dir_all(&app_dir).unwrap();
        manager.create_master("3.12", &app_dir).await.unwrap();
        fs::write(
            manager.packages_dir(MASTER_ENV).join("requests-2.32.0"),
            b"pkg",
        )
        .unwrap();
        fs::write(
            manager.packages_dir(MASTER_ENV).join("nvidia-cublas-12.8"),
            b"huge",
        )
        .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_create_master_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir).await;

        // Second call is a no-op, not an error
        manager
            .create_master("3.12", &dir.path().join("app"))
            .await
            .unwrap();
        assert!(manager.master_dir().join("env.json").is_file());
    }

    #[tokio::test]
    async fn test_clone_copies_packages_and_strips_master() {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir).await;

        manager
            .clone_env("main", &ProgressReporter::discard(), &CancelToken::new())
            .await
            .unwrap();

        // Clone has everything, including the bulky package
        assert!(manager.packages_dir("main").join("requests-2.32.0").is_file());
        assert!(manager
            .packages_dir("main")
            .join("nvidia-cublas-12.8")
            .is_file());

        // Master lost only the bulky package
        assert!(manager
            .packages_dir(MASTER_ENV)
            .join("requests-2.32.0")
            .is_file());
        assert!(!manager
            .packages_dir(MASTER_ENV)
            .join("nvidia-cublas-12.8")
            .exists());
    }

    #[tokio::test]
    async fn test_second_clone_does_not_strip_again() {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir).await;

        manager
            .clone_env("first", &ProgressReporter::discard(), &CancelToken::new())
            .await
            .unwrap();
        manager
            .clone_env("second", &ProgressReporter::discard(), &CancelToken::new())
            .await
            .unwrap();

        // Second clone is made from the already-stripped master
        assert!(!manager
            .packages_dir("second")
            .join("nvidia-cublas-12.8")
            .exists());
        assert!(manager
            .packages_dir("second")
            .join("requests-2.32.0")
            .is_file());
    }

    #[tokio::test]
    async fn test_cancelled_clone_leaves_no_partial_env() {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir).await;

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = manager
            .clone_env("main", &ProgressReporter::discard(), &cancel)
            .await;

        assert!(result.is_err());
        assert!(!manager.env_dir("main").exists());
    }

    #[tokio::test]
    async fn test_resolve_active_prefers_record_then_first_then_none() {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir).await;

        // No environments yet
        let inst = installation_at(dir.path(), None);
        assert_eq!(manager.resolve_active(&inst), None);

        manager
            .clone_env("alpha", &ProgressReporter::discard(), &CancelToken::new())
            .await
            .unwrap();
        manager
            .clone_env("beta", &ProgressReporter::discard(), &CancelToken::new())
            .await
            .unwrap();

        // Explicit active env wins
        let inst = installation_at(dir.path(), Some("beta"));
        assert_eq!(manager.resolve_active(&inst).as_deref(), Some("beta"));

        // Missing active env falls back to the first on disk
        let inst = installation_at(dir.path(), Some("gone"));
        assert_eq!(manager.resolve_active(&inst).as_deref(), Some("alpha"));
    }
}
