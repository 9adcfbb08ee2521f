//! Tool bundle handed to plugins at execution time
//!
//! Plugins hold no state of their own; everything they need — the store,
//! settings, pipeline, update tracker, and the per-operation progress,
//! output, and cancellation channels — arrives through this context.

use std::sync::Arc;

use anyhow::Result;

use crucible_core::types::{Installation, ProgressReporter};
use crucible_core::{CancelToken, InstallationStore, OutputSink, Settings};
use crucible_migrate::Migrator;
use crucible_pipeline::Downloader;
use crucible_snapshot::SnapshotService;
use crucible_update::{ReleaseClient, UpdateTracker};

/// Everything a plugin method may touch during one operation
#[derive(Clone)]
pub struct InstallContext {
    /// Installation record store
    pub store: Arc<dyn InstallationStore>,

    /// Host-supplied settings
    pub settings: Settings,

    /// Download/extract pipeline with its archive cache
    pub downloader: Downloader,

    /// Shared release/update tracker
    pub updates: Arc<UpdateTracker>,

    /// Progress channel for the current operation
    pub reporter: ProgressReporter,

    /// Line-oriented output channel (subprocess stdout/stderr)
    pub output: OutputSink,

    /// Cooperative cancellation token for the current operation
    pub cancel: CancelToken,
}

impl InstallContext {
    /// Client against the configured releases host
    pub fn releases(&self) -> Result<ReleaseClient> {
        ReleaseClient::new(self.settings.releases_base_url.clone())
    }

    /// Snapshot service bound to one installation
    pub fn snapshots(&self, installation: &Installation) -> SnapshotService {
        SnapshotService::new(installation, self.store.clone())
    }

    /// Migration engine over the current settings
    pub fn migrator(&self) -> Migrator {
        Migrator::new(self.settings.clone())
    }
}
