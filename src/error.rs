// Centralized error handling
// Every failure the sync engine reports, with the context needed to act on it

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hash::ContentHash;
use crate::sync::conflict::Conflict;

pub type Result<T> = std::result::Result<T, KeepError>;

/// Main error type for blobkeep
#[derive(Debug, Error)]
pub enum KeepError {
    /// Local and remote content differ and overwriting was not forced
    #[error("{0}\nSuggestion: Use force to overwrite")]
    Conflict(Box<Conflict>),

    /// The container location carried inline credentials
    #[error("Credentials in the container location are not permitted: {reason}\nSuggestion: Use a plain URL; the configured managed identity is used automatically")]
    SecurityPolicy { reason: String },

    /// The container location is not of the form https://<host>/<container>
    #[error("Invalid container location '{location}': {reason}\nSuggestion: Use the form https://<host>/<container>")]
    Format { location: String, reason: String },

    /// Downloaded bytes did not hash to the value the store advertised
    #[error("Downloaded blob '{key}' is corrupt: expected hash {expected}, got {actual}\nSuggestion: Retry the download")]
    Integrity {
        key: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("File not found: {}\nSuggestion: Check that the file path is correct and the file exists", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("I/O error while {operation} {}: {source}\nSuggestion: Check file permissions and disk space", .path.display())]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: io::Error,
    },

    /// Failures reported by the blob storage service, passed through as-is
    #[error("Blob storage error while {operation} '{target}': {source:#}")]
    Remote {
        operation: String,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid configuration {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    /// The process already authenticates as another managed identity
    #[error("Managed identity '{requested}' is not active{}\nSuggestion: Use one managed_identity_id per process and create the SyncEngine before starting other work", active_note(.active))]
    Identity {
        requested: String,
        active: Option<String>,
    },
}

impl KeepError {
    /// Create an I/O error with context about the operation and path
    pub fn from_io_error(err: io::Error, operation: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => KeepError::FileNotFound { path },
            _ => KeepError::Io {
                path,
                operation: operation.to_string(),
                source: err,
            },
        }
    }

    pub fn remote(operation: &str, target: impl Into<String>, source: anyhow::Error) -> Self {
        KeepError::Remote {
            operation: operation.to_string(),
            target: target.into(),
            source,
        }
    }

    pub fn format(location: &str, reason: impl Into<String>) -> Self {
        KeepError::Format {
            location: location.to_string(),
            reason: reason.into(),
        }
    }

    pub fn security_policy(reason: impl Into<String>) -> Self {
        KeepError::SecurityPolicy {
            reason: reason.into(),
        }
    }

    /// True when the caller can resolve this by retrying with force
    pub fn is_conflict(&self) -> bool {
        matches!(self, KeepError::Conflict(_))
    }
}

fn active_note(active: &Option<String>) -> String {
    match active {
        Some(active) => format!(" (this process uses '{}')", active),
        None => String::new(),
    }
}

impl From<Conflict> for KeepError {
    fn from(conflict: Conflict) -> Self {
        KeepError::Conflict(Box::new(conflict))
    }
}
