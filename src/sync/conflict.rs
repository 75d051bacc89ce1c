//! Compare-then-act policy and conflict reporting.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::fs::RemoteObject;
use crate::hash::{ContentHash, LocalFileDescriptor};

/// What to do with a single file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Copy the bytes, overwriting the target.
    Transfer,
    /// Both sides already hold the same content.
    Skip,
    /// Contents differ and overwriting was not forced.
    Conflict,
}

/// Decide a transfer from target existence, the force flag and both hashes.
///
/// The hashes are only consulted when the target exists and `forced` is false.
/// A remote side without a stored hash never matches.
pub fn decide(
    target_exists: bool,
    forced: bool,
    local: Option<ContentHash>,
    remote: Option<ContentHash>,
) -> Decision {
    if !target_exists || forced {
        return Decision::Transfer;
    }
    match (local, remote) {
        (Some(l), Some(r)) if l == r => Decision::Skip,
        _ => Decision::Conflict,
    }
}

/// Information about one side of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub hash: Option<ContentHash>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Option<ContentHash>) -> Self {
        self.hash = hash;
        self
    }

    fn modified_display(&self) -> String {
        match self.modified {
            Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "unknown".to_string(),
        }
    }
}

impl From<&LocalFileDescriptor> for FileInfo {
    fn from(local: &LocalFileDescriptor) -> Self {
        FileInfo::new(local.path.display().to_string(), local.size, local.modified)
            .with_hash(Some(local.hash))
    }
}

impl From<&RemoteObject> for FileInfo {
    fn from(remote: &RemoteObject) -> Self {
        FileInfo::new(remote.key.clone(), remote.size, remote.modified)
            .with_hash(remote.content_hash)
    }
}

/// A local file and a blob that should hold the same bytes but do not.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Local file path.
    pub path: PathBuf,
    /// Remote key.
    pub key: String,
    pub local: FileInfo,
    pub remote: FileInfo,
}

impl Conflict {
    pub fn new(local: &LocalFileDescriptor, remote: &RemoteObject) -> Self {
        Self {
            path: local.path.clone(),
            key: remote.key.clone(),
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Local file '{}' ({} bytes, last modified {}) doesn't match blob '{}' ({} bytes, last modified {})",
            self.path.display(),
            self.local.size,
            self.local.modified_display(),
            self.key,
            self.remote.size,
            self.remote.modified_display(),
        )
    }
}
