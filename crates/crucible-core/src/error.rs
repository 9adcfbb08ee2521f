//! Error types for crucible-core

use thiserror::Error;

use crate::utils::human_readable_size;

/// Result type alias using crucible-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Crucible
#[derive(Error, Debug)]
pub enum Error {
    /// Operation cancelled by the user; a terminal state, not a failure
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Installation record not found in the store
    #[error("Installation not found: {id}")]
    InstallationNotFound { id: String },

    /// Unknown source plugin id
    #[error("Unknown source: {source_id}. Valid sources: standalone, portable, git, remote, cloud")]
    UnknownSource { source_id: String },

    /// A second operation was requested while one is active for the same id
    #[error("An operation is already running for installation {id}")]
    OperationInFlight { id: String },

    /// Pre-flight disk space check failed
    #[error(
        "Insufficient disk space: {} required, {} available",
        human_readable_size(*.required),
        human_readable_size(*.available)
    )]
    InsufficientDiskSpace { required: u64, available: u64 },

    /// Pre-flight port check failed
    #[error("Port {port} is already in use")]
    PortInUse { port: u16 },

    /// Download failure
    #[error("Download failed: {message}")]
    DownloadFailed { message: String },

    /// Archive extraction failure
    #[error("Extraction failed: {message}")]
    ExtractionFailed { message: String },

    /// Release metadata failed structural validation
    #[error("Invalid release metadata: {message}")]
    InvalidRelease { message: String },

    /// Missing required field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Subprocess exited with a non-zero status
    #[error("Command `{command}` failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },
}

impl Error {
    /// Create an installation-not-found error
    pub fn installation_not_found(id: impl Into<String>) -> Self {
        Self::InstallationNotFound { id: id.into() }
    }

    /// Create an unknown-source error
    pub fn unknown_source(source_id: impl Into<String>) -> Self {
        Self::UnknownSource {
            source_id: source_id.into(),
        }
    }

    /// Create an operation-in-flight error
    pub fn operation_in_flight(id: impl Into<String>) -> Self {
        Self::OperationInFlight { id: id.into() }
    }

    /// Create a download-failed error
    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message: message.into(),
        }
    }

    /// Create an extraction-failed error
    pub fn extraction_failed(message: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            message: message.into(),
        }
    }

    /// Create an invalid-release error
    pub fn invalid_release(message: impl Into<String>) -> Self {
        Self::InvalidRelease {
            message: message.into(),
        }
    }

    /// Create a missing-field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Whether this error represents a user cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_space_message_is_human_readable() {
        let err = Error::InsufficientDiskSpace {
            required: 5 * 1024 * 1024 * 1024,
            available: 512 * 1024 * 1024,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient disk space: 5.00 GB required, 512.00 MB available"
        );
    }
}
