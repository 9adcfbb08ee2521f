//! Standalone bundle strategy
//!
//! Downloads a prebuilt runtime+application release for a chosen hardware
//! variant, extracts it, bootstraps the environment manager, and takes the
//! boot snapshot. This is the richest variant; it also owns the
//! apply-update, snapshot, and migrate actions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crucible_core::types::{
    ActionData, ActionDescriptor, ActionResult, ActionStyle, ConfirmSpec, DetailSection,
    DownloadFile, FieldDescriptor, FieldKind, FieldOption, InstallStatus, Installation,
    InstallationPatch, LaunchCommand, ProgressStep, PromptSpec, SelectSpec, UpdateTrack,
};
use crucible_core::Error;
use crucible_env::{EnvManager, MASTER_ENV, PHASE_ENV};
use crucible_migrate::MigrationCategory;
use crucible_pipeline::{PHASE_DOWNLOAD, PHASE_EXTRACT};
use crucible_snapshot::SnapshotTrigger;
use crucible_update::Release;

use crate::context::InstallContext;
use crate::plugin::{required, SourcePlugin};

pub const SOURCE_ID: &str = "standalone";

/// Environment created at install and activated by default
pub const DEFAULT_ENV: &str = "main";

/// Interpreter version assumed when the bundle does not pin one
const DEFAULT_PYTHON: &str = "3.12";

/// Port the bundled application listens on unless overridden
const DEFAULT_PORT: u16 = 8188;

/// Free space required before an update is dispatched; covers the new
/// bundle plus the staging copy held while the old tree is swapped out
const UPDATE_MIN_FREE_BYTES: u64 = 20 * 1024 * 1024 * 1024;

/// Hardware/platform variants a release may ship assets for
const VARIANTS: &[(&str, &str)] = &[
    ("linux-nvidia-cu128", "Linux (NVIDIA, CUDA 12.8)"),
    ("linux-cpu", "Linux (CPU only)"),
    ("windows-nvidia-cu128", "Windows (NVIDIA, CUDA 12.8)"),
    ("windows-cpu", "Windows (CPU only)"),
    ("macos-arm64", "macOS (Apple Silicon)"),
];

pub const ACTION_CHECK_UPDATE: &str = "check-update";
pub const ACTION_APPLY_UPDATE: &str = "apply-update";
pub const ACTION_SNAPSHOT: &str = "snapshot";
pub const ACTION_RESTORE: &str = "restore-snapshot";
pub const ACTION_MIGRATE: &str = "migrate";
pub const ACTION_SET_TRACK: &str = "set-track";

#[derive(Debug)]
pub struct StandaloneSource;

impl StandaloneSource {
    fn app_dir(installation: &Installation) -> PathBuf {
        installation.install_path.join("app")
    }

    /// Cache identifier for one (repository, tag) release
    fn release_id(repository: &str, tag: &str) -> String {
        format!("{}@{}", repository, tag)
    }

    /// Pick the release assets matching a hardware variant
    fn files_for_variant(release: &Release, variant: &str) -> Result<Vec<DownloadFile>> {
        let files: Vec<DownloadFile> = release
            .assets
            .iter()
            .filter(|asset| asset.name.contains(variant))
            .map(|asset| DownloadFile {
                url: asset.browser_download_url.clone(),
                filename: asset.name.clone(),
                expected_size: asset.size,
            })
            .collect();
        if files.is_empty() {
            return Err(anyhow!(Error::invalid_release(format!(
                "release {} has no asset for variant {}",
                release.tag_name, variant
            ))));
        }
        Ok(files)
    }

    /// Resolve what to download: the record's pinned file set, or the
    /// release's assets for the record's variant
    async fn resolve_files(
        &self,
        installation: &Installation,
        tag: &str,
        ctx: &InstallContext,
    ) -> Result<Vec<DownloadFile>> {
        if !installation.download_files.is_empty() {
            return Ok(installation.download_files.clone());
        }
        let variant = installation
            .variant
            .as_deref()
            .ok_or_else(|| anyhow!(Error::missing_field("variant")))?;
        let release = ctx
            .releases()?
            .get_release(&ctx.settings.releases_repository, tag)
            .await?;
        Self::files_for_variant(&release, variant)
    }

    /// Download, extract, and bootstrap for one release tag
    ///
    /// Shared by first install and apply-update; the caller owns the
    /// version-marker bookkeeping.
    async fn install_release(
        &self,
        installation: &Installation,
        tag: &str,
        ctx: &InstallContext,
    ) -> Result<Vec<DownloadFile>> {
        let files = self.resolve_files(installation, tag, ctx).await?;
        let app_dir = Self::app_dir(installation);
        let release_id = Self::release_id(&ctx.settings.releases_repository, tag);

        ctx.downloader
            .fetch_and_extract_all(&release_id, &files, &app_dir, &ctx.reporter, &ctx.cancel)
            .await?;

        let python = installation
            .python_version
            .clone()
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string());
        let envs = EnvManager::new(&installation.install_path);
        envs.create_master(&python, &app_dir).await?;
        if !envs.list_envs()?.contains(&DEFAULT_ENV.to_string()) {
            envs.clone_env(DEFAULT_ENV, &ctx.reporter, &ctx.cancel).await?;
        }

        Ok(files)
    }

    async fn check_update(
        &self,
        installation: &Installation,
        ctx: &InstallContext,
    ) -> Result<ActionResult> {
        let info = ctx
            .updates
            .check(
                &ctx.settings.releases_repository,
                installation.update_track,
                installation.version.as_deref(),
            )
            .await?;

        let message = if info.update_available {
            format!("Update available: {}", info.latest_tag)
        } else {
            format!("Up to date ({})", info.latest_tag)
        };

        let mut update_info = HashMap::new();
        update_info.insert(installation.update_track.as_str().to_string(), info);
        ctx.store
            .update(
                &installation.id,
                InstallationPatch {
                    update_info: Some(update_info),
                    ..Default::default()
                },
            )
            .await?;

        Ok(ActionResult::ok(message))
    }

    /// Re-run the pipeline for the latest release on the record's track
    ///
    /// A pre-update snapshot is taken before anything destructive; the
    /// version marker only advances after the new bundle has landed.
    async fn apply_update(
        &self,
        installation: &Installation,
        ctx: &InstallContext,
    ) -> Result<ActionResult> {
        let info = ctx
            .updates
            .check(
                &ctx.settings.releases_repository,
                installation.update_track,
                installation.version.as_deref(),
            )
            .await?;
        if !info.update_available {
            return Ok(ActionResult::ok(format!(
                "Already on {}",
                info.latest_tag
            )));
        }

        ctx.reporter.steps(vec![
            ProgressStep::new(PHASE_DOWNLOAD, "Download release"),
            ProgressStep::new(PHASE_EXTRACT, "Extract release"),
            ProgressStep::new(PHASE_ENV, "Prepare environment"),
        ]);

        ctx.snapshots(installation)
            .save(SnapshotTrigger::PreUpdate, Some(info.latest_tag.clone()))
            .await?;

        // Force the new release's assets to be resolved, not the pinned set
        let mut pending = installation.clone();
        pending.download_files = Vec::new();
        let files = self.install_release(&pending, &info.latest_tag, ctx).await?;

        ctx.store
            .update(
                &installation.id,
                InstallationPatch {
                    version: Some(info.latest_tag.clone()),
                    download_files: Some(files),
                    ..Default::default()
                },
            )
            .await?;

        info!("{} updated to {}", installation.name, info.latest_tag);
        Ok(ActionResult::ok(format!(
            "Updated to {}",
            info.latest_tag
        )))
    }

    async fn migrate_from(
        &self,
        installation: &Installation,
        data: &ActionData,
        ctx: &InstallContext,
    ) -> Result<ActionResult> {
        let source_id = data
            .selections
            .get("source")
            .ok_or_else(|| anyhow!(Error::missing_field("source")))?;
        let source = ctx.store.get(source_id).await?;

        let categories: Vec<MigrationCategory> = if data.confirmed_options.is_empty() {
            MigrationCategory::all().to_vec()
        } else {
            MigrationCategory::all()
                .iter()
                .filter(|c| data.confirmed_options.contains(&c.as_str().to_string()))
                .copied()
                .collect()
        };

        let report = ctx
            .migrator()
            .migrate(
                &source,
                installation,
                &categories,
                &ctx.reporter,
                &ctx.output,
                &ctx.cancel,
            )
            .await?;

        let copied: usize = report.categories.iter().map(|c| c.copied).sum();
        let dep_failures = report.dependencies.iter().filter(|d| !d.ok).count();
        let message = if dep_failures > 0 {
            format!(
                "Migrated {} item(s); {} extension dependency install(s) failed",
                copied, dep_failures
            )
        } else {
            format!("Migrated {} item(s) from {}", copied, source.name)
        };
        Ok(ActionResult::ok(message))
    }
}

#[async_trait]
impl SourcePlugin for StandaloneSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label(&self) -> &'static str {
        "Standalone bundle"
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor {
                id: "name".to_string(),
                label: "Name".to_string(),
                kind: FieldKind::Text,
                required: true,
                depends_on: None,
            },
            FieldDescriptor {
                id: "install_path".to_string(),
                label: "Install location".to_string(),
                kind: FieldKind::Path,
                required: true,
                depends_on: None,
            },
            FieldDescriptor {
                id: "release".to_string(),
                label: "Release".to_string(),
                kind: FieldKind::Select,
                required: true,
                depends_on: None,
            },
            FieldDescriptor {
                id: "variant".to_string(),
                label: "Hardware variant".to_string(),
                kind: FieldKind::Select,
                required: true,
                depends_on: Some("release".to_string()),
            },
        ]
    }

    async fn resolve_options(
        &self,
        field: &str,
        installation: Option<&Installation>,
        _selections: &HashMap<String, String>,
        ctx: &InstallContext,
    ) -> Result<Vec<FieldOption>> {
        match field {
            "release" => {
                let releases = ctx
                    .releases()?
                    .list_releases(&ctx.settings.releases_repository, 10)
                    .await?;
                Ok(releases
                    .iter()
                    .map(|r| {
                        FieldOption::new(
                            r.tag_name.clone(),
                            r.name.clone().unwrap_or_else(|| r.tag_name.clone()),
                        )
                    })
                    .collect())
            }
            "variant" => Ok(VARIANTS
                .iter()
                .map(|(value, label)| FieldOption::new(*value, *label))
                .collect()),
            "snapshot" => {
                let Some(installation) = installation else {
                    return Ok(Vec::new());
                };
                let entries = ctx.snapshots(installation).list().await?;
                Ok(entries
                    .iter()
                    .map(|entry| {
                        let label = match &entry.snapshot.label {
                            Some(label) => format!("{} ({})", entry.filename, label),
                            None => entry.filename.clone(),
                        };
                        FieldOption::new(entry.filename.clone(), label)
                    })
                    .collect())
            }
            "migrate-source" => {
                let records = ctx.store.list().await?;
                Ok(records
                    .iter()
                    .filter(|r| {
                        r.status == InstallStatus::Installed
                            && installation.map_or(true, |current| r.id != current.id)
                    })
                    .map(|r| FieldOption::new(r.id.clone(), r.name.clone()))
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn build_installation(
        &self,
        selections: &HashMap<String, String>,
    ) -> Result<InstallationPatch> {
        let name = required(selections, "name")?;
        let install_path = required(selections, "install_path")?;
        let release = required(selections, "release")?;
        let variant = required(selections, "variant")?;

        Ok(InstallationPatch {
            name: Some(name.to_string()),
            source_id: Some(SOURCE_ID.to_string()),
            install_path: Some(PathBuf::from(install_path)),
            version: Some(release.to_string()),
            variant: Some(variant.to_string()),
            python_version: Some(
                selections
                    .get("python_version")
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
            ),
            ..Default::default()
        })
    }

    fn launch_command(&self, installation: &Installation) -> Option<LaunchCommand> {
        if installation.status != InstallStatus::Installed {
            return None;
        }
        let envs = EnvManager::new(&installation.install_path);
        let env = envs.resolve_active(installation)?;

        let mut args = vec!["main.py".to_string()];
        args.extend(installation.launch_args.iter().cloned());

        Some(LaunchCommand {
            program: envs.python_path(&env),
            args,
            cwd: Self::app_dir(installation),
            port: Some(port_from_args(&installation.launch_args).unwrap_or(DEFAULT_PORT)),
        })
    }

    async fn install(&self, installation: &Installation, ctx: &InstallContext) -> Result<()> {
        let tag = installation
            .version
            .clone()
            .ok_or_else(|| anyhow!(Error::missing_field("version")))?;

        ctx.reporter.steps(vec![
            ProgressStep::new(PHASE_DOWNLOAD, "Download bundle"),
            ProgressStep::new(PHASE_EXTRACT, "Extract bundle"),
            ProgressStep::new(PHASE_ENV, "Prepare environment"),
        ]);

        let files = self.install_release(installation, &tag, ctx).await?;

        ctx.store
            .update(
                &installation.id,
                InstallationPatch {
                    download_files: Some(files),
                    active_env: Some(Some(DEFAULT_ENV.to_string())),
                    ..Default::default()
                },
            )
            .await?;

        Ok(())
    }

    async fn post_install(
        &self,
        installation: &Installation,
        ctx: &InstallContext,
    ) -> Result<()> {
        // First snapshot, so rollback always has a baseline
        ctx.snapshots(installation)
            .save(SnapshotTrigger::Boot, None)
            .await?;
        Ok(())
    }

    fn probe(&self, dir: &Path) -> Option<InstallationPatch> {
        if !dir.join("app").is_dir() || !dir.join("envs").join(MASTER_ENV).is_dir() {
            return None;
        }
        let name = dir.file_name()?.to_string_lossy().to_string();
        Some(InstallationPatch {
            name: Some(name),
            source_id: Some(SOURCE_ID.to_string()),
            install_path: Some(dir.to_path_buf()),
            status: Some(InstallStatus::Installed),
            ..Default::default()
        })
    }

    fn list_actions(&self, installation: &Installation) -> Vec<ActionDescriptor> {
        let installed = installation.status == InstallStatus::Installed;
        let update_ready = installation
            .update_info
            .get(installation.update_track.as_str())
            .is_some_and(|info| info.update_available);

        let check = ActionDescriptor {
            enabled: installed,
            disabled_reason: (!installed).then(|| "Not installed yet".to_string()),
            ..ActionDescriptor::new(ACTION_CHECK_UPDATE, "Check for updates")
        };

        let apply = ActionDescriptor {
            style: ActionStyle::Primary,
            enabled: installed && update_ready,
            disabled_reason: (!update_ready).then(|| "No update available".to_string()),
            confirm: Some(ConfirmSpec {
                title: "Apply update".to_string(),
                message: "A snapshot is taken first so you can roll back.".to_string(),
                options: Vec::new(),
            }),
            min_free_bytes: Some(UPDATE_MIN_FREE_BYTES),
            show_progress: true,
            progress_title: Some("Updating".to_string()),
            cancellable: true,
            ..ActionDescriptor::new(ACTION_APPLY_UPDATE, "Apply update")
        };

        let snapshot = ActionDescriptor {
            enabled: installed,
            disabled_reason: (!installed).then(|| "Not installed yet".to_string()),
            prompt: Some(PromptSpec {
                label: "Snapshot label (optional)".to_string(),
                required: false,
                pattern: None,
            }),
            show_progress: true,
            progress_title: Some("Taking snapshot".to_string()),
            ..ActionDescriptor::new(ACTION_SNAPSHOT, "Take snapshot")
        };

        let migrate = ActionDescriptor {
            enabled: installed,
            disabled_reason: (!installed).then(|| "Not installed yet".to_string()),
            confirm: Some(ConfirmSpec {
                title: "Migrate user data".to_string(),
                message: "Pick what to bring over. Nothing at the destination is overwritten."
                    .to_string(),
                options: MigrationCategory::all()
                    .iter()
                    .map(|c| FieldOption::new(c.as_str(), c.as_str()))
                    .collect(),
            }),
            selects: vec![SelectSpec {
                id: "source".to_string(),
                label: "Migrate from".to_string(),
                options: Vec::new(),
                field: Some("migrate-source".to_string()),
            }],
            show_progress: true,
            progress_title: Some("Migrating".to_string()),
            cancellable: true,
            ..ActionDescriptor::new(ACTION_MIGRATE, "Migrate data from...")
        };

        let restore = ActionDescriptor {
            style: ActionStyle::Danger,
            enabled: installed && installation.snapshot_count > 0,
            disabled_reason: (installation.snapshot_count == 0)
                .then(|| "No snapshots taken yet".to_string()),
            confirm: Some(ConfirmSpec {
                title: "Restore snapshot".to_string(),
                message: "Extensions and packages will be reconciled to the snapshot."
                    .to_string(),
                options: Vec::new(),
            }),
            selects: vec![SelectSpec {
                id: "snapshot".to_string(),
                label: "Snapshot".to_string(),
                options: Vec::new(),
                field: Some("snapshot".to_string()),
            }],
            show_progress: true,
            progress_title: Some("Restoring".to_string()),
            cancellable: true,
            ..ActionDescriptor::new(ACTION_RESTORE, "Restore snapshot")
        };

        let track = ActionDescriptor {
            selects: vec![SelectSpec {
                id: "track".to_string(),
                label: "Update track".to_string(),
                options: vec![
                    FieldOption::new("stable", "Stable releases"),
                    FieldOption::new("latest", "Latest (including prereleases)"),
                ],
                field: None,
            }],
            ..ActionDescriptor::new(ACTION_SET_TRACK, "Change update track")
        };

        vec![check, apply, snapshot, restore, migrate, track]
    }

    fn detail_sections(&self, installation: &Installation) -> Vec<DetailSection> {
        let mut rows = vec![
            (
                "Version".to_string(),
                installation.version.clone().unwrap_or_else(|| "—".to_string()),
            ),
            (
                "Variant".to_string(),
                installation.variant.clone().unwrap_or_else(|| "—".to_string()),
            ),
            (
                "Update track".to_string(),
                installation.update_track.as_str().to_string(),
            ),
        ];
        if let Some(env) = &installation.active_env {
            rows.push(("Active environment".to_string(), env.clone()));
        }
        rows.push((
            "Snapshots".to_string(),
            installation.snapshot_count.to_string(),
        ));

        vec![DetailSection {
            title: "Installation".to_string(),
            rows,
        }]
    }

    async fn handle_action(
        &self,
        action_id: &str,
        installation: &Installation,
        data: &ActionData,
        ctx: &InstallContext,
    ) -> Result<ActionResult> {
        match action_id {
            ACTION_CHECK_UPDATE => self.check_update(installation, ctx).await,
            ACTION_APPLY_UPDATE => self.apply_update(installation, ctx).await,
            ACTION_SNAPSHOT => {
                let filename = ctx
                    .snapshots(installation)
                    .save(SnapshotTrigger::Manual, data.prompt_value.clone())
                    .await?;
                Ok(ActionResult::ok(format!("Snapshot saved: {}", filename)))
            }
            ACTION_RESTORE => {
                let filename = data
                    .selections
                    .get("snapshot")
                    .ok_or_else(|| anyhow!(Error::missing_field("snapshot")))?;
                let summary = ctx
                    .snapshots(installation)
                    .restore(filename, &ctx.output, &ctx.cancel)
                    .await?;
                if summary.reverted {
                    return Ok(ActionResult {
                        ok: false,
                        message: Some(
                            "Package reconciliation failed; previous state restored".to_string(),
                        ),
                        mode: Some("reverted".to_string()),
                        ..Default::default()
                    });
                }
                Ok(ActionResult::ok(format!(
                    "Restored {} ({} extension change(s), {} package change(s))",
                    filename,
                    summary.extensions.installed
                        + summary.extensions.changed
                        + summary.extensions.removed,
                    summary.packages.installed
                        + summary.packages.changed
                        + summary.packages.removed,
                )))
            }
            ACTION_MIGRATE => self.migrate_from(installation, data, ctx).await,
            ACTION_SET_TRACK => {
                let track = match data.selections.get("track").map(String::as_str) {
                    Some("latest") => UpdateTrack::Latest,
                    Some("stable") => UpdateTrack::Stable,
                    other => {
                        warn!("Unknown track selection: {:?}", other);
                        return Ok(ActionResult::failed("Unknown update track"));
                    }
                };
                ctx.store
                    .update(
                        &installation.id,
                        InstallationPatch {
                            update_track: Some(track),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ActionResult::ok(format!(
                    "Now following the {} track",
                    track.as_str()
                )))
            }
            other => Ok(ActionResult::failed(format!("Unknown action: {}", other))),
        }
    }
}

/// Port from launch args (`--port 8080` or `--port=8080`)
fn port_from_args(args: &[String]) -> Option<u16> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--port" {
            return iter.next()?.parse().ok();
        }
        if let Some(value) = arg.strip_prefix("--port=") {
            return value.parse().ok();
        }
    }
    None
}
