//! Download & extract pipeline for Crucible
//!
//! This crate handles:
//! - Content-addressed caching of release archives
//! - Multi-file downloads with percent-of-bytes progress
//! - Archive extraction via the platform archive tool
//! - All-or-nothing cleanup on failure

pub mod cache;
pub mod download;
pub mod extract;

pub use cache::{cache_key, DownloadCache};
pub use download::{Downloader, PHASE_DOWNLOAD};
pub use extract::PHASE_EXTRACT;
