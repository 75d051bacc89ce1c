use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::fs::location::ContainerLocation;
use crate::hash::ContentHash;

/// Properties of an object held by the blob service
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// `None` when the service holds no digest for the object
    pub content_hash: Option<ContentHash>,
    pub content_type: Option<String>,
}

/// One blob container.
///
/// Keys are relative to the container (or its root prefix). Transport,
/// retries and authentication belong to the implementation.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Check whether an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch hash, size and modification time of an object
    async fn properties(&self, key: &str) -> Result<RemoteObject>;

    /// Upload a local file, overwriting any existing object.
    ///
    /// The object is tagged with `media_type` and `hash`.
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        media_type: &str,
        hash: ContentHash,
    ) -> Result<()>;

    /// Download an object into a local file, creating or truncating it
    async fn download(&self, key: &str, local_path: &Path) -> Result<()>;

    /// List objects whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Human-readable location of a key, for messages
    fn display_path(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Opens the store behind a resolved container location
pub trait StoreConnector: Send + Sync {
    fn connect(&self, location: &ContainerLocation) -> Result<Arc<dyn BlobStore>>;
}
