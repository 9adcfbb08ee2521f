//! Typed lifecycle event bus
//!
//! The engine emits events rather than exposing shared mutable "currently
//! running" maps; any number of independent observers subscribe and filter
//! by installation id. Lagging subscribers lose old events, never block
//! the engine.

use tokio::sync::broadcast;

use crucible_core::types::{ActionResult, ProgressEvent};

/// One lifecycle or stream event for one installation
#[derive(Debug, Clone)]
pub struct EngineEvent {
    /// Installation the event belongs to
    pub installation_id: String,

    /// What happened
    pub kind: EventKind,
}

/// Event payload
#[derive(Debug, Clone)]
pub enum EventKind {
    /// An operation began
    Started { action: String },

    /// Progress from the running operation
    Progress(ProgressEvent),

    /// One line of subprocess output
    Output(String),

    /// The operation completed
    Finished(ActionResult),

    /// The operation failed
    Failed { message: String },

    /// The operation was cancelled by the user; terminal, not a failure
    Cancelled,
}

/// Broadcast bus for engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit an event; dropped silently when nobody is listening
    pub fn emit(&self, installation_id: impl Into<String>, kind: EventKind) {
        let _ = self.tx.send(EngineEvent {
            installation_id: installation_id.into(),
            kind,
        });
    }

    /// Subscribe to every installation's events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to one installation's events only
    pub fn subscribe_installation(&self, installation_id: impl Into<String>) -> FilteredEvents {
        FilteredEvents {
            rx: self.tx.subscribe(),
            installation_id: installation_id.into(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that only yields events for one installation id
pub struct FilteredEvents {
    rx: broadcast::Receiver<EngineEvent>,
    installation_id: String,
}

impl FilteredEvents {
    /// Next event for the subscribed installation; None when the bus closes
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.installation_id == self.installation_id => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filtered_subscription_sees_only_its_id() {
        let bus = EventBus::new();
        let mut events = bus.subscribe_installation("inst-a");

        bus.emit("inst-b", EventKind::Cancelled);
        bus.emit(
            "inst-a",
            EventKind::Started {
                action: "install".to_string(),
            },
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.installation_id, "inst-a");
        assert!(matches!(event.kind, EventKind::Started { .. }));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.emit("inst-a", EventKind::Cancelled);
    }
}
