//! # crucible-core
//!
//! Core library for the Crucible installation engine providing:
//! - Installation record and patch-merge primitives
//! - Durable keyed-JSON installation store
//! - Progress event and action descriptor types
//! - Cooperative cancellation tokens
//! - Line-streamed subprocess execution

pub mod cancel;
pub mod error;
pub mod output;
pub mod proc;
pub mod settings;
pub mod store;
pub mod types;
pub mod utils;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use output::OutputSink;
pub use settings::{ConflictPolicy, Settings};
pub use store::{InstallationStore, JsonInstallationStore};
