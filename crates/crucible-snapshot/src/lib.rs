//! Snapshot subsystem for Crucible
//!
//! Captures, restores, and deletes point-in-time state (installed
//! third-party extensions plus the exact package set of the active
//! environment) for a local installation. Snapshots are immutable once
//! written and ordered newest-first.

pub mod restore;
pub mod snapshot;

pub use restore::{PhaseCounts, RestoreSummary};
pub use snapshot::{
    ExtensionState, PackageSpec, Snapshot, SnapshotEntry, SnapshotService, SnapshotTrigger,
};
