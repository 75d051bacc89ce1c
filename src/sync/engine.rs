//! Sync engine for single-file store and retrieve.
//!
//! Every call resolves the container, hashes the local file, compares it
//! with the hash the blob service holds and then transfers, skips or
//! reports a conflict. Steps run strictly one after another.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::KeepConfig;
use crate::error::{KeepError, Result};
use crate::fs::{
    export_managed_identity, media_type, resolve_location, AzureConnector, BlobStore, ContainerLocation, RemoteObject,
    StoreConnector,
};
use crate::hash::hash_file_async;
use crate::sync::conflict::{decide, Conflict, Decision};

/// Which way the bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file to blob.
    Store,
    /// Blob to local file.
    Retrieve,
}

/// A single transfer, constructed per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    pub key: String,
    pub location: String,
    /// Overwrite the target even if its content differs.
    pub forced: bool,
}

impl TransferRequest {
    pub fn new(
        local_path: impl Into<PathBuf>,
        key: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            key: key.into(),
            location: location.into(),
            forced: false,
        }
    }

    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }
}

/// Result of a transfer that did not conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Bytes were copied.
    Transferred,
    /// The target already held identical content; nothing was copied.
    AlreadySynced,
}

impl TransferOutcome {
    pub fn is_transferred(&self) -> bool {
        matches!(self, Self::Transferred)
    }
}

pub struct SyncEngine {
    config: KeepConfig,
    connector: Arc<dyn StoreConnector>,
}

impl SyncEngine {
    /// Engine talking to Azure Blob Storage as the configured managed identity
    ///
    /// Exports the identity to the process environment on first use, so
    /// construct the engine before spawning other threads or tasks.
    ///
    /// # Errors
    /// Returns `KeepError::Identity` if the process already authenticates
    /// as a different managed identity.
    pub fn new(config: KeepConfig) -> Result<Self> {
        if let Some(id) = &config.managed_identity_id {
            export_managed_identity(id)?;
        }
        let connector =
            AzureConnector::new(config.managed_identity_id.clone(), config.upload_buffer_size);
        Ok(Self::with_connector(config, connector))
    }

    /// Engine configured from the config file and environment
    pub fn from_default_config() -> Result<Self> {
        Self::new(KeepConfig::load()?)
    }

    pub fn with_connector(config: KeepConfig, connector: impl StoreConnector + 'static) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
        }
    }

    pub fn config(&self) -> &KeepConfig {
        &self.config
    }

    fn open(&self, location: &str) -> Result<(ContainerLocation, Arc<dyn BlobStore>)> {
        let location = resolve_location(location)?;
        let store = self
            .connector
            .connect(&location)
            .map_err(|e| KeepError::remote("connecting to", location.to_string(), e))?;
        Ok((location, store))
    }

    /// Store a local file as `key`.
    pub async fn store(
        &self,
        local_path: impl AsRef<Path>,
        key: &str,
        location: &str,
        forced: bool,
    ) -> Result<TransferOutcome> {
        let request = TransferRequest::new(local_path.as_ref(), key, location).forced(forced);
        self.transfer(Direction::Store, &request).await
    }

    /// Retrieve `key` into a local file.
    pub async fn retrieve(
        &self,
        local_path: impl AsRef<Path>,
        key: &str,
        location: &str,
        forced: bool,
    ) -> Result<TransferOutcome> {
        let request = TransferRequest::new(local_path.as_ref(), key, location).forced(forced);
        self.transfer(Direction::Retrieve, &request).await
    }

    pub async fn transfer(
        &self,
        direction: Direction,
        request: &TransferRequest,
    ) -> Result<TransferOutcome> {
        match direction {
            Direction::Store => self.store_request(request).await,
            Direction::Retrieve => self.retrieve_request(request).await,
        }
    }

    /// List blobs whose key starts with `prefix`.
    pub async fn list_stored(&self, prefix: &str, location: &str) -> Result<Vec<RemoteObject>> {
        let (location, store) = self.open(location)?;
        let prefix = prefix.trim_start_matches('/');

        let mut objects = store
            .list(prefix)
            .await
            .map_err(|e| KeepError::remote("listing", format!("{}/{}", location, prefix), e))?;
        objects.retain(|o| o.key.starts_with(prefix));

        debug!(prefix, count = objects.len(), "listed stored blobs");
        Ok(objects)
    }

    async fn store_request(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let key = request.key.as_str();
        info!("Storing '{}' as '{}'...", request.local_path.display(), key);

        let (_, store) = self.open(&request.location)?;
        let target = store.display_path(key);

        let local = hash_file_async(&request.local_path, self.config.hash_chunk_size).await?;
        debug!(hash = %local.hash, size = local.size, "hashed local file");

        let target_exists = !request.forced
            && store
                .exists(key)
                .await
                .map_err(|e| KeepError::remote("checking", &target, e))?;
        let remote = if target_exists {
            Some(
                store
                    .properties(key)
                    .await
                    .map_err(|e| KeepError::remote("reading properties of", &target, e))?,
            )
        } else {
            None
        };

        let decision = decide(
            target_exists,
            request.forced,
            Some(local.hash),
            remote.as_ref().and_then(|r| r.content_hash),
        );
        match (decision, remote) {
            (Decision::Skip, Some(remote)) => {
                info!(
                    "File with matching hash was already stored on {}.",
                    remote
                        .modified
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "an unknown date".to_string())
                );
                return Ok(TransferOutcome::AlreadySynced);
            }
            (Decision::Conflict, Some(remote)) => {
                let conflict = Conflict::new(&local, &remote);
                warn!("{}", conflict);
                return Err(conflict.into());
            }
            _ => {}
        }

        let media_type = media_type(&request.local_path);
        store
            .upload(&request.local_path, key, media_type, local.hash)
            .await
            .map_err(|e| KeepError::remote("uploading", &target, e))?;

        info!(size = local.size, media_type, "Stored '{}'", target);
        Ok(TransferOutcome::Transferred)
    }

    async fn retrieve_request(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let key = request.key.as_str();
        let path = request.local_path.as_path();
        info!("Retrieving '{}' from '{}'...", path.display(), key);

        let (_, store) = self.open(&request.location)?;
        let target = store.display_path(key);

        let target_exists = !request.forced
            && tokio::fs::try_exists(path)
                .await
                .map_err(|e| KeepError::from_io_error(e, "checking", path))?;

        let remote = store
            .properties(key)
            .await
            .map_err(|e| KeepError::remote("reading properties of", &target, e))?;

        if target_exists {
            let local = hash_file_async(path, self.config.hash_chunk_size).await?;
            if decide(true, false, Some(local.hash), remote.content_hash) == Decision::Skip {
                info!("Local file already exists and matches the blob hash.");
                return Ok(TransferOutcome::AlreadySynced);
            }
            let conflict = Conflict::new(&local, &remote);
            warn!("{}", conflict);
            return Err(conflict.into());
        }

        self.download_verified(store.as_ref(), &remote, path, &target)
            .await?;

        info!(size = remote.size, "Retrieved '{}'", target);
        Ok(TransferOutcome::Transferred)
    }

    /// Download next to the target, check the hash, then move into place.
    async fn download_verified(
        &self,
        store: &dyn BlobStore,
        remote: &RemoteObject,
        path: &Path,
        target: &str,
    ) -> Result<()> {
        let partial = partial_path(path)?;

        if let Err(e) = store.download(&remote.key, &partial).await {
            discard_partial(&partial).await;
            return Err(KeepError::remote("downloading", target, e));
        }

        let downloaded = hash_file_async(&partial, self.config.hash_chunk_size).await?;
        if let Some(expected) = remote.content_hash {
            if expected != downloaded.hash {
                discard_partial(&partial).await;
                warn!(%expected, actual = %downloaded.hash, "hash mismatch after download of '{}'", target);
                return Err(KeepError::Integrity {
                    key: remote.key.clone(),
                    expected,
                    actual: downloaded.hash,
                });
            }
        }

        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| KeepError::from_io_error(e, "moving into place", path))?;
        Ok(())
    }
}

async fn discard_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %partial.display(), error = %e, "could not remove partial download");
        }
    }
}

/// `report.csv` -> `report.csv.part` in the same directory
fn partial_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| KeepError::Io {
        path: path.to_path_buf(),
        operation: "resolving file name of".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
    })?;
    let mut partial = name.to_os_string();
    partial.push(".part");
    Ok(path.with_file_name(partial))
}
