//! Portable bundle strategy
//!
//! A single self-contained archive, unpacked and run as-is. No environment
//! manager and no update path; the version is pinned at install time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crucible_core::types::{
    ActionData, ActionDescriptor, ActionResult, DetailSection, DownloadFile, FieldDescriptor,
    FieldKind, FieldOption, InstallStatus, Installation, InstallationPatch, LaunchCommand,
    ProgressStep,
};
use crucible_core::Error;
use crucible_pipeline::{PHASE_DOWNLOAD, PHASE_EXTRACT};

use crate::context::InstallContext;
use crate::plugin::{required, SourcePlugin};

pub const SOURCE_ID: &str = "portable";

pub const ACTION_CHECK_UPDATE: &str = "check-update";

#[derive(Debug)]
pub struct PortableSource;

impl PortableSource {
    fn app_dir(installation: &Installation) -> PathBuf {
        installation.install_path.join("app")
    }

    fn launcher(app: &Path) -> PathBuf {
        if cfg!(windows) {
            app.join("run.bat")
        } else {
            app.join("run.sh")
        }
    }
}

#[async_trait]
impl SourcePlugin for PortableSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label(&self) -> &'static str {
        "Portable bundle"
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
        ]
    }

    async fn resolve_options(
        &self,
        field: &str,
        _installation: Option<&Installation>,
        _selections: &HashMap<String, String>,
        ctx: &InstallContext,
    ) -> Result<Vec<FieldOption>> {
        if field != "release" {
            return Ok(Vec::new());
        }
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

    fn build_installation(
        &self,
        selections: &HashMap<String, String>,
    ) -> Result<InstallationPatch> {
        let name = required(selections, "name")?;
        let install_path = required(selections, "install_path")?;
        let release = required(selections, "release")?;

        Ok(InstallationPatch {
            name: Some(name.to_string()),
            source_id: Some(SOURCE_ID.to_string()),
            install_path: Some(PathBuf::from(install_path)),
            version: Some(release.to_string()),
            ..Default::default()
        })
    }

    fn launch_command(&self, installation: &Installation) -> Option<LaunchCommand> {
        if installation.status != InstallStatus::Installed {
            return None;
        }
        let app = Self::app_dir(installation);
        let launcher = Self::launcher(&app);
        if !launcher.is_file() {
            return None;
        }
        Some(LaunchCommand {
            program: launcher,
            args: installation.launch_args.clone(),
            cwd: app,
            port: None,
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
        ]);

        let files = if !installation.download_files.is_empty() {
            installation.download_files.clone()
        } else {
            let release = ctx
                .releases()?
                .get_release(&ctx.settings.releases_repository, &tag)
                .await?;
            // Portable ships exactly one archive per release
            let asset = release
                .assets
                .iter()
                .find(|a| a.name.contains("portable"))
                .or_else(|| release.assets.first())
                .ok_or_else(|| {
                    anyhow!(Error::invalid_release(format!(
                        "release {} has no assets",
                        tag
                    )))
                })?;
            vec![DownloadFile {
                url: asset.browser_download_url.clone(),
                filename: asset.name.clone(),
                expected_size: asset.size,
            }]
        };

        let release_id = format!("{}@{}", ctx.settings.releases_repository, tag);
        ctx.downloader
            .fetch_and_extract_all(
                &release_id,
                &files,
                &Self::app_dir(installation),
                &ctx.reporter,
                &ctx.cancel,
            )
            .await?;

        ctx.store
            .update(
                &installation.id,
                InstallationPatch {
                    download_files: Some(files),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    fn probe(&self, dir: &Path) -> Option<InstallationPatch> {
        let app = dir.join("app");
        if !Self::launcher(&app).is_file() {
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
        vec![ActionDescriptor {
            enabled: installed,
            disabled_reason: (!installed).then(|| "Not installed yet".to_string()),
            ..ActionDescriptor::new(ACTION_CHECK_UPDATE, "Check for updates")
        }]
    }

    fn detail_sections(&self, installation: &Installation) -> Vec<DetailSection> {
        vec![DetailSection {
            title: "Bundle".to_string(),
            rows: vec![(
                "Version (pinned)".to_string(),
                installation.version.clone().unwrap_or_else(|| "—".to_string()),
            )],
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
                // Informational only: portable versions are pinned, updating
                // means installing a new bundle alongside.
                let info = ctx
                    .updates
                    .check(
                        &ctx.settings.releases_repository,
                        installation.update_track,
                        installation.version.as_deref(),
                    )
                    .await?;
                let message = if info.update_available {
                    format!(
                        "{} is out; portable installs are pinned, install it as a new bundle",
                        info.latest_tag
                    )
                } else {
                    format!("Up to date ({})", info.latest_tag)
                };
                Ok(ActionResult::ok(message))
            }
            other => Ok(ActionResult::failed(format!("Unknown action: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_build_installation_pins_version() {
        let mut selections = HashMap::new();
        selections.insert("name".to_string(), "Portable".to_string());
        selections.insert("install_path".to_string(), "/data/portable".to_string());
        selections.insert("release".to_string(), "v2.0.0".to_string());

        let patch = PortableSource.build_installation(&selections).unwrap();
        assert_eq!(patch.version.as_deref(), Some("v2.0.0"));
    }

    #[test]
    fn test_launch_requires_launcher_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let installation = Installation {
            id: "p-1".to_string(),
            created_at: Utc::now(),
            name: "Portable".to_string(),
            status: InstallStatus::Installed,
            install_path: dir.path().to_path_buf(),
            source_id: SOURCE_ID.to_string(),
            version: Some("v2.0.0".to_string()),
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

        assert!(PortableSource.launch_command(&installation).is_none());

        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(PortableSource::launcher(&app), b"#!/bin/sh\n").unwrap();
        let command = PortableSource.launch_command(&installation).unwrap();
        assert_eq!(command.cwd, app);
    }
}
