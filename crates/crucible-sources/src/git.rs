//! Git checkout strategy
//!
//! Clones the application repository and updates it in place. The update
//! flow emits structured marker lines on the output stream so the caller
//! can recover the exact before/after state: pre-update HEAD, the backup
//! branch name, post-update HEAD, and the tag checked out on the stable
//! track. A pre-update snapshot is always taken before anything
//! destructive, and the version marker only advances after the update has
//! fully succeeded.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crucible_core::proc::{run_captured, run_logged};
use crucible_core::types::{
    ActionData, ActionDescriptor, ActionResult, ActionStyle, ConfirmSpec, DetailSection,
    FieldDescriptor, FieldKind, InstallStatus, Installation, InstallationPatch, LaunchCommand,
    ProgressStep, UpdateTrack,
};
use crucible_core::utils::compact_timestamp;
use crucible_core::{ConflictPolicy, Error};
use crucible_env::{EnvManager, PHASE_ENV};
use crucible_snapshot::SnapshotTrigger;

use crate::context::InstallContext;
use crate::plugin::{required, SourcePlugin};

pub const SOURCE_ID: &str = "git";

const DEFAULT_ENV: &str = "main";
const DEFAULT_PYTHON: &str = "3.12";

pub const ACTION_CHECK_UPDATE: &str = "check-update";
pub const ACTION_UPDATE: &str = "update";

/// Marker lines emitted on the output stream during an update
pub const MARKER_PRE_HEAD: &str = "[PRE_UPDATE_HEAD]";
pub const MARKER_BACKUP_BRANCH: &str = "[BACKUP_BRANCH]";
pub const MARKER_POST_HEAD: &str = "[POST_UPDATE_HEAD]";
pub const MARKER_CHECKED_OUT_TAG: &str = "[CHECKED_OUT_TAG]";

const PHASE_CLONE: &str = "clone";
const PHASE_FETCH: &str = "fetch";
const PHASE_CHECKOUT: &str = "checkout";
const PHASE_DEPS: &str = "dependencies";

#[derive(Debug)]
pub struct GitSource;

impl GitSource {
    fn app_dir(installation: &Installation) -> PathBuf {
        installation.install_path.join("app")
    }

    fn repo_url(installation: &Installation) -> Result<String> {
        installation
            .extra
            .get("repo_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!(Error::missing_field("repo_url")))
    }

    /// The structured-marker update flow
    async fn run_update(
        &self,
        installation: &Installation,
        ctx: &InstallContext,
    ) -> Result<ActionResult> {
        let app = Self::app_dir(installation);

        ctx.reporter.steps(vec![
            ProgressStep::new(PHASE_FETCH, "Fetch changes"),
            ProgressStep::new(PHASE_CHECKOUT, "Check out new version"),
            ProgressStep::new(PHASE_DEPS, "Reconcile dependencies"),
        ]);

        ctx.snapshots(installation)
            .save(SnapshotTrigger::PreUpdate, None)
            .await?;

        let pre_head = run_captured("git", &["rev-parse", "HEAD"], &app).await?;
        ctx.output.line(format!("{} {}", MARKER_PRE_HEAD, pre_head));

        let requirements_before = read_requirements(&app);

        let backup = format!("backup_branch_{}", compact_timestamp(Utc::now()));
        run_logged(
            "git",
            &["branch", &backup],
            &app,
            &ctx.output,
            &ctx.cancel,
        )
        .await?;
        ctx.output.line(format!("{} {}", MARKER_BACKUP_BRANCH, backup));

        // Local edits would make the checkout fail; park them
        run_logged("git", &["stash"], &app, &ctx.output, &ctx.cancel).await?;

        ctx.reporter.indeterminate(PHASE_FETCH, "git fetch");
        run_logged(
            "git",
            &["fetch", "--all", "--tags", "--prune"],
            &app,
            &ctx.output,
            &ctx.cancel,
        )
        .await?;

        ctx.reporter.indeterminate(PHASE_CHECKOUT, "checkout");
        let new_marker = match installation.update_track {
            UpdateTrack::Stable => {
                let tags = run_captured(
                    "git",
                    &["tag", "--list", "--sort=-v:refname"],
                    &app,
                )
                .await?;
                let tag = tags
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| anyhow!("Repository has no tags to follow"))?
                    .to_string();
                run_logged("git", &["checkout", &tag], &app, &ctx.output, &ctx.cancel).await?;
                ctx.output
                    .line(format!("{} {}", MARKER_CHECKED_OUT_TAG, tag));
                tag
            }
            UpdateTrack::Latest => {
                run_logged(
                    "git",
                    &["merge", "--ff-only", "@{u}"],
                    &app,
                    &ctx.output,
                    &ctx.cancel,
                )
                .await?;
                run_captured("git", &["rev-parse", "--short", "HEAD"], &app).await?
            }
        };

        let post_head = run_captured("git", &["rev-parse", "HEAD"], &app).await?;
        ctx.output.line(format!("{} {}", MARKER_POST_HEAD, post_head));

        if post_head == pre_head {
            info!("{} already at {}", installation.name, new_marker);
            return Ok(ActionResult::ok(format!("Already on {}", new_marker)));
        }

        let requirements_after = read_requirements(&app);
        let changed = diff_requirements(&requirements_before, &requirements_after);
        if !changed.is_empty() {
            self.reconcile_dependencies(installation, &changed, ctx)
                .await?;
        }

        ctx.store
            .update(
                &installation.id,
                InstallationPatch {
                    version: Some(new_marker.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!("{} updated to {}", installation.name, new_marker);
        Ok(ActionResult::ok(format!("Updated to {}", new_marker)))
    }

    /// Install only the requirement lines the update changed
    ///
    /// A dry run surfaces conflicts first; the configured policy decides
    /// whether a conflict blocks the update or merely warns.
    async fn reconcile_dependencies(
        &self,
        installation: &Installation,
        changed: &[String],
        ctx: &InstallContext,
    ) -> Result<()> {
        let envs = EnvManager::new(&installation.install_path);
        let Some(active) = envs.resolve_active(installation) else {
            warn!("No active environment, skipping dependency reconciliation");
            return Ok(());
        };
        let python = envs.python_path(&active).to_string_lossy().to_string();

        ctx.reporter.indeterminate(
            PHASE_DEPS,
            format!("{} changed requirement(s)", changed.len()),
        );

        let mut dry_args = vec!["-m", "pip", "install", "--dry-run"];
        dry_args.extend(changed.iter().map(String::as_str));
        let dry_run = run_logged(
            &python,
            &dry_args,
            &installation.install_path,
            &ctx.output,
            &ctx.cancel,
        )
        .await;

        if let Err(err) = dry_run {
            if err.is_cancelled() {
                return Err(err.into());
            }
            match ctx.settings.update_conflict_policy {
                ConflictPolicy::Block => {
                    return Err(anyhow!(
                        "Dependency conflict detected, update blocked: {}",
                        err
                    ));
                }
                ConflictPolicy::Warn => {
                    warn!("Dependency dry run reported conflicts, proceeding: {}", err);
                    ctx.output
                        .line(format!("warning: dependency conflicts reported: {}", err));
                }
            }
        }

        let mut args = vec!["-m", "pip", "install"];
        args.extend(changed.iter().map(String::as_str));
        run_logged(
            &python,
            &args,
            &installation.install_path,
            &ctx.output,
            &ctx.cancel,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SourcePlugin for GitSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label(&self) -> &'static str {
        "Git checkout"
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
                id: "repo_url".to_string(),
                label: "Repository URL".to_string(),
                kind: FieldKind::Text,
                required: true,
                depends_on: None,
            },
        ]
    }

    fn build_installation(
        &self,
        selections: &std::collections::HashMap<String, String>,
    ) -> Result<InstallationPatch> {
        let name = required(selections, "name")?;
        let install_path = required(selections, "install_path")?;
        let repo_url = required(selections, "repo_url")?;

        let mut patch = InstallationPatch {
            name: Some(name.to_string()),
            source_id: Some(SOURCE_ID.to_string()),
            install_path: Some(PathBuf::from(install_path)),
            python_version: Some(DEFAULT_PYTHON.to_string()),
            ..Default::default()
        };
        patch
            .extra
            .insert("repo_url".to_string(), serde_json::json!(repo_url));
        Ok(patch)
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
            port: None,
        })
    }

    async fn install(&self, installation: &Installation, ctx: &InstallContext) -> Result<()> {
        let repo_url = Self::repo_url(installation)?;
        let app = Self::app_dir(installation);
        fs::create_dir_all(&installation.install_path)?;

        ctx.reporter.steps(vec![
            ProgressStep::new(PHASE_CLONE, "Clone repository"),
            ProgressStep::new(PHASE_ENV, "Prepare environment"),
        ]);

        ctx.reporter.indeterminate(PHASE_CLONE, repo_url.as_str());
        let app_arg = app.to_string_lossy().to_string();
        run_logged(
            "git",
            &["clone", &repo_url, &app_arg],
            &installation.install_path,
            &ctx.output,
            &ctx.cancel,
        )
        .await?;

        let python = installation
            .python_version
            .clone()
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string());
        let envs = EnvManager::new(&installation.install_path);
        envs.create_master(&python, &app).await?;
        envs.clone_env(DEFAULT_ENV, &ctx.reporter, &ctx.cancel)
            .await?;

        let head = run_captured("git", &["rev-parse", "--short", "HEAD"], &app).await?;
        ctx.store
            .update(
                &installation.id,
                InstallationPatch {
                    version: Some(head),
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
        ctx.snapshots(installation)
            .save(SnapshotTrigger::Boot, None)
            .await?;
        Ok(())
    }

    fn probe(&self, dir: &Path) -> Option<InstallationPatch> {
        if !dir.join("app").join(".git").is_dir() {
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

        let check = ActionDescriptor {
            enabled: installed,
            disabled_reason: (!installed).then(|| "Not installed yet".to_string()),
            ..ActionDescriptor::new(ACTION_CHECK_UPDATE, "Check for updates")
        };

        let update = ActionDescriptor {
            style: ActionStyle::Primary,
            enabled: installed,
            disabled_reason: (!installed).then(|| "Not installed yet".to_string()),
            confirm: Some(ConfirmSpec {
                title: "Update checkout".to_string(),
                message: "Local changes are stashed and a backup branch is created first."
                    .to_string(),
                options: Vec::new(),
            }),
            show_progress: true,
            progress_title: Some("Updating".to_string()),
            cancellable: true,
            ..ActionDescriptor::new(ACTION_UPDATE, "Update")
        };

        vec![check, update]
    }

    fn detail_sections(&self, installation: &Installation) -> Vec<DetailSection> {
        let mut rows = Vec::new();
        if let Ok(url) = Self::repo_url(installation) {
            rows.push(("Repository".to_string(), url));
        }
        rows.push((
            "Revision".to_string(),
            installation.version.clone().unwrap_or_else(|| "—".to_string()),
        ));
        rows.push((
            "Update track".to_string(),
            installation.update_track.as_str().to_string(),
        ));

        vec![DetailSection {
            title: "Checkout".to_string(),
            rows,
        }]
    }

    async fn handle_action(
        &self,
        action_id: &str,
        installation: &Installation,
        _data: &ActionData,
        ctx: &InstallContext,
    ) -> Result<ActionResult> {
        match action_id {
            ACTION_CHECK_UPDATE => {
                let app = Self::app_dir(installation);
                run_logged(
                    "git",
                    &["fetch", "--tags", "--prune"],
                    &app,
                    &ctx.output,
                    &ctx.cancel,
                )
                .await?;
                let behind = run_captured(
                    "git",
                    &["rev-list", "--count", "HEAD..@{u}"],
                    &app,
                )
                .await
                .unwrap_or_else(|_| "0".to_string());
                if behind.trim() == "0" {
                    Ok(ActionResult::ok("Up to date"))
                } else {
                    Ok(ActionResult::ok(format!(
                        "{} new commit(s) available",
                        behind.trim()
                    )))
                }
            }
            ACTION_UPDATE => self.run_update(installation, ctx).await,
            other => Ok(ActionResult::failed(format!("Unknown action: {}", other))),
        }
    }
}

fn read_requirements(app: &Path) -> String {
    fs::read_to_string(app.join("requirements.txt")).unwrap_or_default()
}

/// Requirement lines present after the update but not before
///
/// Comments and blank lines are ignored; a changed pin shows up as a new
/// line and is therefore reinstalled.
pub(crate) fn diff_requirements(before: &str, after: &str) -> Vec<String> {
    let old: HashSet<&str> = before
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    after
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| !old.contains(l))
        .map(str::to_string)
        .collect()
}
