//! Progress events and the reporter that streams them
//!
//! An operation either emits "flat" events (phase/status/percent) or first
//! announces an ordered step list and then emits per-phase flat events.
//! Once a step list has been announced, flat events naming a phase outside
//! the list are dropped rather than forwarded.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Percent value meaning "indeterminate"
pub const PERCENT_INDETERMINATE: f32 = -1.0;

/// One declared phase of a stepped operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStep {
    /// Phase identifier referenced by subsequent flat events
    pub phase: String,

    /// Human-readable label
    pub label: String,
}

impl ProgressStep {
    pub fn new(phase: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            label: label.into(),
        }
    }
}

/// Progress event streamed to listeners for one installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Single-phase progress; `percent < 0` means indeterminate
    Flat {
        phase: String,
        status: String,
        percent: f32,
    },

    /// Ordered step announcement for a multi-phase operation
    Steps { steps: Vec<ProgressStep> },

    /// Terminal event for the operation
    Done,
}

/// Cloneable reporter handle carried through an operation
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: UnboundedSender<ProgressEvent>,
    declared: Arc<Mutex<Option<HashSet<String>>>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiving end of its event stream
    pub fn channel() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                declared: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }

    /// Reporter that discards every event; for callers without listeners
    pub fn discard() -> Self {
        let (reporter, _rx) = Self::channel();
        reporter
    }

    /// Announce the ordered phases of a stepped operation
    pub fn steps(&self, steps: Vec<ProgressStep>) {
        let set: HashSet<String> = steps.iter().map(|s| s.phase.clone()).collect();
        *self.declared.lock().expect("progress state poisoned") = Some(set);
        let _ = self.tx.send(ProgressEvent::Steps { steps });
    }

    /// Emit a flat event; dropped if it names a phase outside the step list
    pub fn flat(&self, phase: impl Into<String>, status: impl Into<String>, percent: f32) {
        let phase = phase.into();
        if let Some(declared) = self
            .declared
            .lock()
            .expect("progress state poisoned")
            .as_ref()
        {
            if !declared.contains(&phase) {
                debug!("Dropping progress event for undeclared phase: {}", phase);
                return;
            }
        }
        let _ = self.tx.send(ProgressEvent::Flat {
            phase,
            status: status.into(),
            percent,
        });
    }

    /// Emit an indeterminate flat event
    pub fn indeterminate(&self, phase: impl Into<String>, status: impl Into<String>) {
        self.flat(phase, status, PERCENT_INDETERMINATE);
    }

    /// Emit the terminal event
    pub fn done(&self) {
        let _ = self.tx.send(ProgressEvent::Done);
    }
}
