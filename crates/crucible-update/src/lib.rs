//! Release/update tracking for Crucible
//!
//! This crate handles:
//! - Release metadata fetch from the releases host
//! - Structural validation of untrusted responses
//! - Per-(repository, track) caching with a staleness window
//! - Per-installation installed-vs-latest comparison

pub mod releases;
pub mod tracker;

pub use releases::{Release, ReleaseAsset, ReleaseClient};
pub use tracker::UpdateTracker;
