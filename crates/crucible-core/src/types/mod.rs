//! Type definitions shared across the Crucible engine

pub mod action;
pub mod installation;
pub mod progress;

pub use action::{
    ActionData, ActionDescriptor, ActionResult, ActionStyle, ConfirmSpec, DetailSection,
    FieldDescriptor, FieldKind, FieldOption, PortConflict, PromptSpec, SelectSpec,
};
pub use installation::{
    DownloadFile, InstallStatus, Installation, InstallationPatch, LaunchCommand, UpdateInfo,
    UpdateTrack,
};
pub use progress::{ProgressEvent, ProgressReporter, ProgressStep};
