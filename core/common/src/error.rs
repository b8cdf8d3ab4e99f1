//! Common error types for the Stowage gateway.
//!
//! Every backend failure is converted into one of these kinds before it
//! leaves an adapter. Each kind carries an HTTP-style status code that the
//! transport shim renders without re-interpretation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not found, or the path shape does not match the resource kind.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path string could not be parsed.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backend returned an unexpected status while fetching metadata.
    #[error("Metadata error: {message}")]
    Metadata { status: u16, message: String },

    /// Download failed.
    #[error("Download error: {message}")]
    Download { status: u16, message: String },

    /// Upload failed.
    #[error("Upload error: {message}")]
    Upload { status: u16, message: String },

    /// Destination reported a different checksum than the one observed
    /// while relaying the payload.
    #[error("Upload checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    UploadChecksumMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// Delete failed.
    #[error("Delete error: {message}")]
    Delete { status: u16, message: String },

    /// Folder creation failed.
    #[error("Create folder error: {message}")]
    CreateFolder { status: u16, message: String },

    /// A file or folder already occupies the folder name.
    #[error("Cannot create folder \"{0}\", because a file or folder already exists with that name")]
    FolderNamingConflict(String),

    /// Destination name is taken and the conflict policy is `warn`.
    #[error("Cannot complete action: file or folder \"{0}\" already exists in this location")]
    NamingConflict(String),

    /// Listing revisions failed.
    #[error("Revisions error: {message}")]
    Revisions { status: u16, message: String },

    /// Copy failed.
    #[error("Copy error: {message}")]
    Copy { status: u16, message: String },

    /// Move failed.
    #[error("Move error: {message}")]
    Move { status: u16, message: String },

    /// Write attempted on a backend that only serves reads.
    #[error("Provider '{0}' is read-only")]
    ReadOnlyProvider(String),

    /// Provider does not implement the requested action.
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// Transport-level failure talking to a backend.
    #[error("Network error: {0}")]
    Network(String),

    /// Backend call exceeded its request timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Backend answered with a status no more specific kind claimed.
    #[error("Backend returned {status}: {message}")]
    Provider { status: u16, message: String },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Metadata error with the backend status attached.
    pub fn metadata(status: u16, message: impl Into<String>) -> Self {
        Self::Metadata {
            status,
            message: message.into(),
        }
    }

    pub fn download(status: u16, message: impl Into<String>) -> Self {
        Self::Download {
            status,
            message: message.into(),
        }
    }

    pub fn upload(status: u16, message: impl Into<String>) -> Self {
        Self::Upload {
            status,
            message: message.into(),
        }
    }

    pub fn delete(status: u16, message: impl Into<String>) -> Self {
        Self::Delete {
            status,
            message: message.into(),
        }
    }

    pub fn create_folder(status: u16, message: impl Into<String>) -> Self {
        Self::CreateFolder {
            status,
            message: message.into(),
        }
    }

    pub fn revisions(status: u16, message: impl Into<String>) -> Self {
        Self::Revisions {
            status,
            message: message.into(),
        }
    }

    pub fn copy(status: u16, message: impl Into<String>) -> Self {
        Self::Copy {
            status,
            message: message.into(),
        }
    }

    pub fn move_error(status: u16, message: impl Into<String>) -> Self {
        Self::Move {
            status,
            message: message.into(),
        }
    }

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::InvalidPath(_) | Error::InvalidInput(_) | Error::UnsupportedAction(_) => 400,
            Error::Metadata { status, .. }
            | Error::Download { status, .. }
            | Error::Upload { status, .. }
            | Error::Delete { status, .. }
            | Error::CreateFolder { status, .. }
            | Error::Revisions { status, .. }
            | Error::Copy { status, .. }
            | Error::Move { status, .. }
            | Error::Provider { status, .. } => *status,
            Error::UploadChecksumMismatch { .. } => 500,
            Error::FolderNamingConflict(_) | Error::NamingConflict(_) => 409,
            Error::ReadOnlyProvider(_) => 501,
            Error::Network(_) => 503,
            Error::Timeout(_) => 504,
            Error::Io(_) | Error::Serialization(_) => 500,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidPath(_) => "invalid_path",
            Error::InvalidInput(_) => "invalid_input",
            Error::Metadata { .. } => "metadata_error",
            Error::Download { .. } => "download_error",
            Error::Upload { .. } => "upload_error",
            Error::UploadChecksumMismatch { .. } => "upload_checksum_mismatch",
            Error::Delete { .. } => "delete_error",
            Error::CreateFolder { .. } => "create_folder_error",
            Error::FolderNamingConflict(_) => "folder_naming_conflict",
            Error::NamingConflict(_) => "naming_conflict",
            Error::Revisions { .. } => "revisions_error",
            Error::Copy { .. } => "copy_error",
            Error::Move { .. } => "move_error",
            Error::ReadOnlyProvider(_) => "read_only_provider",
            Error::UnsupportedAction(_) => "unsupported_action",
            Error::Network(_) => "network_error",
            Error::Timeout(_) => "timeout",
            Error::Provider { .. } => "provider_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Timeouts, connection failures, 5xx and rate-limit responses qualify.
    /// Checksum mismatches never do: the destination may already hold a
    /// partial object.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Provider { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Structured rendering for the transport shim and failed tasks.
    pub fn to_payload(&self) -> ErrorPayload {
        let detail = match self {
            Error::UploadChecksumMismatch {
                algorithm,
                expected,
                actual,
            } => Some(serde_json::json!({
                "algorithm": algorithm,
                "expected": expected,
                "actual": actual,
            })),
            Error::FolderNamingConflict(name) | Error::NamingConflict(name) => {
                Some(serde_json::json!({ "name": name }))
            }
            _ => None,
        };

        ErrorPayload {
            status: self.status_code(),
            code: self.code().to_string(),
            message: self.to_string(),
            detail,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Serializable error rendering: status, kind code, message and optional detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
