// Shared test fixtures
// In-memory blob container that records every transfer

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use blobkeep::{BlobStore, ContainerLocation, ContentHash, RemoteObject, StoreConnector};

pub const LOCATION: &str = "https://acct.blob.core.windows.net/reports";

#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub hash: Option<ContentHash>,
    pub content_type: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Blob>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a blob tagged with its true hash
    pub fn put(&self, key: &str, data: &[u8]) {
        self.put_with_hash(key, data, Some(ContentHash::of(data)));
    }

    pub fn put_with_hash(&self, key: &str, data: &[u8], hash: Option<ContentHash>) {
        self.blobs.lock().unwrap().insert(
            key.to_string(),
            Blob {
                data: data.to_vec(),
                hash,
                content_type: None,
                modified: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
            },
        );
    }

    pub fn blob(&self, key: &str) -> Option<Blob> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn describe(key: &str, blob: &Blob) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            size: blob.data.len() as u64,
            modified: Some(blob.modified),
            content_hash: blob.hash,
            content_type: blob.content_type.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(key))
    }

    async fn properties(&self, key: &str) -> Result<RemoteObject> {
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs.get(key).ok_or_else(|| anyhow!("BlobNotFound: {}", key))?;
        Ok(Self::describe(key, blob))
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        media_type: &str,
        hash: ContentHash,
    ) -> Result<()> {
        let data = std::fs::read(local_path)?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.blobs.lock().unwrap().insert(
            key.to_string(),
            Blob {
                data,
                hash: Some(hash),
                content_type: Some(media_type.to_string()),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let blob = self
            .blob(key)
            .ok_or_else(|| anyhow!("BlobNotFound: {}", key))?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, &blob.data)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, blob)| Self::describe(key, blob))
            .collect())
    }
}

/// Hands out the same store for every location and records what was asked for
#[derive(Clone)]
pub struct MemoryConnector {
    pub store: Arc<MemoryStore>,
    pub locations: Arc<Mutex<Vec<ContainerLocation>>>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            locations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connections(&self) -> Vec<ContainerLocation> {
        self.locations.lock().unwrap().clone()
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, location: &ContainerLocation) -> Result<Arc<dyn BlobStore>> {
        self.locations.lock().unwrap().push(location.clone());
        let store: Arc<dyn BlobStore> = self.store.clone();
        Ok(store)
    }
}
