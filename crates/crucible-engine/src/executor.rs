//! Orchestrated execution of installs and plugin actions
//!
//! Every mutating operation flows through here: the chain is evaluated
//! first (a cancel aborts with no side effects), pre-flight checks run
//! next, then the plugin is dispatched under the per-installation lock
//! with progress, output, and cancellation wired to the event bus. A
//! panicking handler produces a failed result, never a crashed engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crucible_core::types::{
    ActionResult, InstallStatus, Installation, InstallationPatch, ProgressReporter,
};
use crucible_core::{CancelToken, Error, InstallationStore, OutputSink, Settings};
use crucible_pipeline::Downloader;
use crucible_sources::{InstallContext, SourceRegistry};
use crucible_update::UpdateTracker;

use crate::chain::{run_chain, ChainOutcome, ChainPrompter};
use crate::events::{EventBus, EventKind};
use crate::locks::OperationLocks;
use crate::preflight;

/// The engine's front door for installs, actions, and removal
pub struct ActionExecutor {
    store: Arc<dyn InstallationStore>,
    settings: Settings,
    registry: Arc<SourceRegistry>,
    downloader: Downloader,
    updates: Arc<UpdateTracker>,
    events: EventBus,
    locks: OperationLocks,
    running: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn InstallationStore>,
        settings: Settings,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let updates = Arc::new(UpdateTracker::new(
            settings.releases_base_url.clone(),
            settings.release_cache_ttl_secs,
        )?);
        Ok(Self {
            store,
            downloader: Downloader::new(cache_dir)?,
            updates,
            settings,
            registry: Arc::new(SourceRegistry::new()),
            events: EventBus::new(),
            locks: OperationLocks::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The event bus observers subscribe to
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The plugin registry, for descriptor queries
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Request cancellation of the in-flight operation for an id
    pub fn cancel(&self, installation_id: &str) {
        if let Some(token) = self
            .running
            .lock()
            .expect("running state poisoned")
            .get(installation_id)
        {
            info!("Cancellation requested for {}", installation_id);
            token.cancel();
        }
    }

    /// Validate selections through the plugin and persist the pending record
    pub async fn create_installation(
        &self,
        source_id: &str,
        selections: &HashMap<String, String>,
    ) -> Result<Installation> {
        let plugin = self.registry.get(source_id)?;
        let patch = plugin.build_installation(selections)?;
        Ok(self.store.create(patch).await?)
    }

    /// Run a pending installation's install under the framework
    ///
    /// The status flips to Installed only on success. Cancellation leaves
    /// it untouched; any other failure marks it Failed.
    pub async fn run_install(&self, installation_id: &str) -> Result<ActionResult> {
        let record = self.store.get(installation_id).await?;
        let plugin = self.registry.get(&record.source_id)?;

        let _guard = self.locks.acquire(installation_id)?;
        let ctx = self.operation_context(installation_id);
        self.events.emit(
            installation_id,
            EventKind::Started {
                action: "install".to_string(),
            },
        );

        let handle = tokio::spawn({
            let plugin = plugin.clone();
            let record = record.clone();
            let ctx = ctx.clone();
            async move { plugin.install(&record, &ctx).await }
        });
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(anyhow!("Install handler panicked")),
            Err(join) => Err(anyhow!(join)),
        };

        let result = match outcome {
            Ok(()) => {
                self.store
                    .update(
                        installation_id,
                        InstallationPatch::status(InstallStatus::Installed),
                    )
                    .await?;
                let installed = self.store.get(installation_id).await?;
                if let Err(err) = plugin.post_install(&installed, &ctx).await {
                    // The install itself landed; a post hook failure is not
                    // worth un-installing over.
                    warn!("post_install failed for {}: {}", installation_id, err);
                }
                let result = ActionResult::ok(format!("{} installed", installed.name));
                self.events
                    .emit(installation_id, EventKind::Finished(result.clone()));
                result
            }
            Err(err) if is_cancelled(&err) => {
                info!("Install cancelled for {}", installation_id);
                self.events.emit(installation_id, EventKind::Cancelled);
                ActionResult::cancelled()
            }
            Err(err) => {
                warn!("Install failed for {}: {}", installation_id, err);
                self.store
                    .update(
                        installation_id,
                        InstallationPatch::status(InstallStatus::Failed),
                    )
                    .await?;
                self.events.emit(
                    installation_id,
                    EventKind::Failed {
                        message: err.to_string(),
                    },
                );
                ActionResult::failed(err.to_string())
            }
        };

        ctx.reporter.done();
        self.finish(installation_id);
        Ok(result)
    }

    /// Execute one declared action for an installation
    pub async fn execute_action(
        &self,
        installation_id: &str,
        action_id: &str,
        prompter: &dyn ChainPrompter,
    ) -> Result<ActionResult> {
        let record = self.store.get(installation_id).await?;
        let plugin = self.registry.get(&record.source_id)?;

        let descriptor = plugin
            .list_actions(&record)
            .into_iter()
            .find(|a| a.id == action_id)
            .ok_or_else(|| {
                anyhow!(
                    "Action {} is not declared by source {}",
                    action_id,
                    record.source_id
                )
            })?;

        if !descriptor.enabled {
            return Ok(ActionResult::failed(
                descriptor
                    .disabled_reason
                    .unwrap_or_else(|| "Action is unavailable".to_string()),
            ));
        }

        // The chain runs against side-effect-free channels; nothing is
        // locked or mutated until every step has been answered.
        let chain_ctx = self.silent_context();
        let data = match run_chain(&descriptor, plugin.as_ref(), &record, prompter, &chain_ctx)
            .await?
        {
            ChainOutcome::Continue(data) => data,
            ChainOutcome::Cancelled => return Ok(ActionResult::cancelled()),
        };

        if let Some(required) = descriptor.min_free_bytes {
            preflight::check_disk_space(&record.install_path, required)?;
        }

        let _guard = self.locks.acquire(installation_id)?;
        let ctx = self.operation_context(installation_id);
        self.events.emit(
            installation_id,
            EventKind::Started {
                action: action_id.to_string(),
            },
        );

        let handle = tokio::spawn({
            let plugin = plugin.clone();
            let record = record.clone();
            let action_id = action_id.to_string();
            let data = data.clone();
            let ctx = ctx.clone();
            async move { plugin.handle_action(&action_id, &record, &data, &ctx).await }
        });
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                warn!("Action {} panicked for {}", action_id, installation_id);
                Ok(ActionResult::failed("Internal error in action handler"))
            }
            Err(join) => Err(anyhow!(join)),
        };

        let result = match outcome {
            Ok(result) => {
                if result.ok {
                    self.events
                        .emit(installation_id, EventKind::Finished(result.clone()));
                } else {
                    self.events.emit(
                        installation_id,
                        EventKind::Failed {
                            message: result
                                .message
                                .clone()
                                .unwrap_or_else(|| "Action failed".to_string()),
                        },
                    );
                }
                result
            }
            Err(err) if is_cancelled(&err) => {
                self.events.emit(installation_id, EventKind::Cancelled);
                ActionResult::cancelled()
            }
            Err(err) => {
                self.events.emit(
                    installation_id,
                    EventKind::Failed {
                        message: err.to_string(),
                    },
                );
                ActionResult::failed(err.to_string())
            }
        };

        ctx.reporter.done();
        self.finish(installation_id);
        Ok(result)
    }

    /// Verify an installation is ready to launch on its configured port
    ///
    /// A contested port comes back as a structured failed result carrying
    /// the next free port, so the caller can offer a remap instead of a
    /// bare error string.
    pub async fn launch_preflight(&self, installation_id: &str) -> Result<ActionResult> {
        let record = self.store.get(installation_id).await?;
        let plugin = self.registry.get(&record.source_id)?;

        let Some(command) = plugin.launch_command(&record) else {
            return Ok(ActionResult::failed("Installation is not ready to launch"));
        };
        let Some(port) = command.port else {
            return Ok(ActionResult::ok("Ready to launch"));
        };

        match preflight::check_port(port) {
            None => Ok(ActionResult::ok("Ready to launch")),
            Some(conflict) => {
                warn!("Port {} contested for {}", port, installation_id);
                let mut message = Error::PortInUse { port }.to_string();
                if let Some(next_free) = conflict.next_free {
                    message.push_str(&format!(" (next free: {})", next_free));
                }
                Ok(ActionResult {
                    ok: false,
                    message: Some(message),
                    port_conflict: Some(conflict),
                    ..Default::default()
                })
            }
        }
    }

    /// Generic removal path; owned by the engine, not plugin-specific
    pub async fn remove_installation(&self, installation_id: &str) -> Result<()> {
        let record = self.store.get(installation_id).await?;
        let _guard = self.locks.acquire(installation_id)?;

        if !record.install_path.as_os_str().is_empty() && record.install_path.exists() {
            // Mark first: if deletion dies halfway the record says so
            self.store
                .update(
                    installation_id,
                    InstallationPatch::status(InstallStatus::PartialDelete),
                )
                .await?;
            tokio::fs::remove_dir_all(&record.install_path).await?;
        }

        self.store.remove(installation_id).await?;
        info!("Removed installation {}", installation_id);
        Ok(())
    }

    /// Context wired to the event bus for one operation
    fn operation_context(&self, installation_id: &str) -> InstallContext {
        let (reporter, mut progress_rx) = ProgressReporter::channel();
        let (output, mut output_rx) = OutputSink::channel();
        let cancel = CancelToken::new();

        self.running
            .lock()
            .expect("running state poisoned")
            .insert(installation_id.to_string(), cancel.clone());

        let events = self.events.clone();
        let id = installation_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                events.emit(id.clone(), EventKind::Progress(event));
            }
        });

        let events = self.events.clone();
        let id = installation_id.to_string();
        tokio::spawn(async move {
            while let Some(line) = output_rx.recv().await {
                events.emit(id.clone(), EventKind::Output(line));
            }
        });

        InstallContext {
            store: self.store.clone(),
            settings: self.settings.clone(),
            downloader: self.downloader.clone(),
            updates: self.updates.clone(),
            reporter,
            output,
            cancel,
        }
    }

    /// Context for chain evaluation: nothing observable, nothing cancellable
    fn silent_context(&self) -> InstallContext {
        InstallContext {
            store: self.store.clone(),
            settings: self.settings.clone(),
            downloader: self.downloader.clone(),
            updates: self.updates.clone(),
            reporter: ProgressReporter::discard(),
            output: OutputSink::discard(),
            cancel: CancelToken::new(),
        }
    }

    fn finish(&self, installation_id: &str) {
        self.running
            .lock()
            .expect("running state poisoned")
            .remove(installation_id);
    }
}

/// Whether an error chain bottoms out in a user cancellation
fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<crucible_core::Error>()
        .is_some_and(crucible_core::Error::is_cancelled)
}
