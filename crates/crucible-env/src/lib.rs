//! Environment management for Crucible installations
//!
//! GPU-specific runtime dependencies run to several gigabytes; a user who
//! wants multiple isolated environments for one installation should not
//! download them twice. A "master" runtime is created once per installation
//! and named environments are cloned from it by copying its package tree.

pub mod manager;
pub mod permissions;

pub use manager::{EnvManager, MASTER_ENV, PHASE_ENV};
