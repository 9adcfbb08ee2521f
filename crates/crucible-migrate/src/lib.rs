//! Cross-installation migration for Crucible
//!
//! Carries user data (extensions, workflows, settings, models, input,
//! output) from one installation into another. File movement is
//! non-destructive; extension dependency installation afterwards is
//! best-effort.

pub mod merge;
pub mod migrate;

pub use merge::{merge_tree, MergeCounts};
pub use migrate::{
    CategoryReport, DependencyReport, MigrationCategory, MigrationReport, Migrator, PHASE_MIGRATE,
};
