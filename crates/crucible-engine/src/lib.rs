//! Action execution framework for Crucible
//!
//! The spine the other subsystems plug into: declarative chain
//! evaluation, pre-flight checks, per-installation mutual exclusion, the
//! lifecycle event bus, and the orchestrated install flow.

pub mod chain;
pub mod events;
pub mod executor;
pub mod locks;
pub mod preflight;

pub use chain::{ApproveAll, ChainOutcome, ChainPrompter, DeclineAll};
pub use events::{EngineEvent, EventBus, EventKind, FilteredEvents};
pub use executor::ActionExecutor;
pub use locks::{OperationGuard, OperationLocks};
