//! Category-based migration between two installations
//!
//! File movement runs first, category by category; dependency installation
//! for migrated extensions runs afterwards and is best-effort. A dependency
//! failure never rolls back files already moved.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crucible_core::proc::run_logged;
use crucible_core::types::{Installation, ProgressReporter};
use crucible_core::utils::compact_timestamp;
use crucible_core::{CancelToken, OutputSink, Settings};
use crucible_env::EnvManager;

use crate::merge::{merge_tree, MergeCounts};

/// Progress phase name used by migration events
pub const PHASE_MIGRATE: &str = "migrate";

/// What a migration may carry over, each independently optional
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationCategory {
    Extensions,
    Workflows,
    Settings,
    Models,
    Input,
    Output,
}

impl MigrationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extensions => "extensions",
            Self::Workflows => "workflows",
            Self::Settings => "settings",
            Self::Models => "models",
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    /// Every category, in migration order
    pub fn all() -> &'static [MigrationCategory] {
        &[
            Self::Extensions,
            Self::Workflows,
            Self::Settings,
            Self::Models,
            Self::Input,
            Self::Output,
        ]
    }

    fn relative_dir(&self) -> &'static str {
        match self {
            Self::Extensions => "app/extensions",
            Self::Workflows => "app/user/workflows",
            Self::Settings => "app/user/settings",
            Self::Models => "app/models",
            Self::Input => "app/input",
            Self::Output => "app/output",
        }
    }

    fn uses_shared_path(&self) -> bool {
        matches!(self, Self::Models | Self::Input | Self::Output)
    }
}

/// Outcome of one category
#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: MigrationCategory,
    /// False when the source had nothing to migrate for this category
    pub present: bool,
    pub copied: usize,
    pub skipped: usize,
    /// Destination directories renamed aside (extensions only)
    pub backed_up: usize,
}

/// Outcome of one extension's dependency install
#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub extension: String,
    pub ok: bool,
    pub message: Option<String>,
}

/// Full migration outcome
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub categories: Vec<CategoryReport>,
    pub dependencies: Vec<DependencyReport>,
}

/// Moves user data from one installation into another
pub struct Migrator {
    settings: Settings,
}

impl Migrator {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run the selected categories from `source` into `dest`
    pub async fn migrate(
        &self,
        source: &Installation,
        dest: &Installation,
        categories: &[MigrationCategory],
        reporter: &ProgressReporter,
        output: &OutputSink,
        cancel: &CancelToken,
    ) -> Result<MigrationReport> {
        if source.id == dest.id {
            return Err(anyhow!("Cannot migrate an installation into itself"));
        }

        info!(
            "Migrating {:?} from {} to {}",
            categories.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            source.name,
            dest.name
        );

        let total = categories.len();
        let mut reports = Vec::with_capacity(total);
        let mut migrated_extensions = Vec::new();

        for (index, category) in categories.iter().enumerate() {
            cancel.err_if_cancelled()?;
            reporter.flat(
                PHASE_MIGRATE,
                format!("Migrating {}", category.as_str()),
                index as f32 / total.max(1) as f32 * 100.0,
            );

            let src_dir = source.install_path.join(category.relative_dir());
            if !src_dir.is_dir() {
                output.line(format!("{}: nothing to migrate", category.as_str()));
                reports.push(CategoryReport {
                    category: *category,
                    present: false,
                    copied: 0,
                    skipped: 0,
                    backed_up: 0,
                });
                continue;
            }

            let dest_dir = self.destination_dir(*category, dest);
            fs::create_dir_all(&dest_dir)?;

            let report = match category {
                MigrationCategory::Extensions => {
                    let (report, names) =
                        migrate_extensions(&src_dir, &dest_dir, output, cancel)?;
                    migrated_extensions = names;
                    report
                }
                _ => {
                    let counts = merge_tree(&src_dir, &dest_dir, cancel)?;
                    output.line(format!(
                        "{}: {} copied, {} already present",
                        category.as_str(),
                        counts.copied,
                        counts.skipped
                    ));
                    CategoryReport {
                        category: *category,
                        present: true,
                        copied: counts.copied,
                        skipped: counts.skipped,
                        backed_up: 0,
                    }
                }
            };
            reports.push(report);
        }

        let dependencies = self
            .install_dependencies(dest, &migrated_extensions, output, cancel)
            .await?;

        reporter.flat(PHASE_MIGRATE, "Migration complete", 100.0);
        Ok(MigrationReport {
            categories: reports,
            dependencies,
        })
    }

    /// Where a category lands at the destination
    ///
    /// Models/Input/Output go to the shared directories when shared paths
    /// are enabled and configured.
    fn destination_dir(&self, category: MigrationCategory, dest: &Installation) -> PathBuf {
        if self.settings.use_shared_paths && category.uses_shared_path() {
            return match category {
                MigrationCategory::Models => self.settings.shared_models_dir.clone(),
                MigrationCategory::Input => self.settings.shared_input_dir.clone(),
                MigrationCategory::Output => self.settings.shared_output_dir.clone(),
                _ => unreachable!(),
            };
        }
        dest.install_path.join(category.relative_dir())
    }

    /// Best-effort install of migrated extensions' declared requirements
    ///
    /// Runs against the destination's active environment. Each extension is
    /// reported on its own; one failure does not stop the rest.
    async fn install_dependencies(
        &self,
        dest: &Installation,
        extensions: &[String],
        output: &OutputSink,
        cancel: &CancelToken,
    ) -> Result<Vec<DependencyReport>> {
        if extensions.is_empty() {
            return Ok(Vec::new());
        }

        let envs = EnvManager::new(&dest.install_path);
        let Some(active) = envs.resolve_active(dest) else {
            warn!("No active environment at destination, skipping dependency phase");
            return Ok(extensions
                .iter()
                .map(|name| DependencyReport {
                    extension: name.clone(),
                    ok: false,
                    message: Some("no active environment".to_string()),
                })
                .collect());
        };
        let python = envs.python_path(&active).to_string_lossy().to_string();

        let mut reports = Vec::with_capacity(extensions.len());
        for name in extensions {
            cancel.err_if_cancelled()?;

            let requirements = dest
                .install_path
                .join("app")
                .join("extensions")
                .join(name)
                .join("requirements.txt");
            if !requirements.is_file() {
                reports.push(DependencyReport {
                    extension: name.clone(),
                    ok: true,
                    message: None,
                });
                continue;
            }

            let requirements_str = requirements.to_string_lossy().to_string();
            let result = run_logged(
                &python,
                &["-m", "pip", "install", "-r", &requirements_str],
                &dest.install_path,
                output,
                cancel,
            )
            .await;

            match result {
                Ok(()) => reports.push(DependencyReport {
                    extension: name.clone(),
                    ok: true,
                    message: None,
                }),
                Err(err) if err.is_cancelled() => return Err(err.into()),
                Err(err) => {
                    warn!("Dependency install failed for {}: {}", name, err);
                    reports.push(DependencyReport {
                        extension: name.clone(),
                        ok: false,
                        message: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(reports)
    }
}

/// Copy extensions wholesale, renaming same-named destination dirs aside
///
/// Returns the report plus the names of extensions that landed, for the
/// dependency phase.
fn migrate_extensions(
    src_dir: &Path,
    dest_dir: &Path,
    output: &OutputSink,
    cancel: &CancelToken,
) -> Result<(CategoryReport, Vec<String>)> {
    let mut copied = 0;
    let mut backed_up = 0;
    let mut names = Vec::new();

    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        cancel.err_if_cancelled()?;

        let name = entry.file_name().to_string_lossy().to_string();
        let target = dest_dir.join(&name);
        if target.exists() {
            let backup = dest_dir.join(format!(
                "{}.backup-{}",
                name,
                compact_timestamp(Utc::now())
            ));
            fs::rename(&target, &backup)?;
            output.line(format!(
                "{}: existing copy moved to {}",
                name,
                backup.file_name().unwrap_or_default().to_string_lossy()
            ));
            backed_up += 1;
        }

        copy_tree(&entry.path(), &target)?;
        output.line(format!("extension {} migrated", name));
        copied += 1;
        names.push(name);
    }

    Ok((
        CategoryReport {
            category: MigrationCategory::Extensions,
            present: true,
            copied,
            skipped: 0,
            backed_up,
        },
        names,
    ))
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
