use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use memmap2::Mmap;
use opendal::{services::Azblob, Metadata, Operator};
use tokio::io::AsyncWriteExt;

use crate::error::KeepError;
use crate::fs::backend::{BlobStore, RemoteObject, StoreConnector};
use crate::fs::location::ContainerLocation;
use crate::hash::ContentHash;

/// User metadata key holding the base64 MD5 of an uploaded file
pub const CONTENT_MD5_METADATA: &str = "content_md5";

/// Environment variable the Azure credential chain reads the identity from
pub const AZURE_CLIENT_ID_ENV: &str = "AZURE_CLIENT_ID";

/// Files up to this size are read into memory for upload, larger ones are mapped (8 MiB)
pub const UPLOAD_BUFFER_SIZE: usize = 8 << 20;

/// Largest blob Azure accepts in a single Put Blob request (5000 MiB)
pub const MAX_SINGLE_UPLOAD: u64 = 5000 << 20;

const TRANSFER_BUFFER: usize = 1 << 20;

/// Managed identity the credential chain of this process authenticates as
static ACTIVE_IDENTITY: OnceLock<String> = OnceLock::new();

/// Make `id` the managed identity for every Azure connection in this process.
///
/// The environment is written at most once. Call this (or `SyncEngine::new`)
/// before spawning threads or starting transfers, since other threads may
/// read the environment concurrently. An `AZURE_CLIENT_ID` that is already
/// set is left alone and becomes the active identity.
///
/// # Errors
/// Returns `KeepError::Identity` if a different identity is already active.
pub fn export_managed_identity(id: &str) -> crate::error::Result<()> {
    let active = ACTIVE_IDENTITY.get_or_init(|| match std::env::var(AZURE_CLIENT_ID_ENV) {
        Ok(current) if !current.trim().is_empty() => current,
        _ => {
            tracing::debug!(client_id = %id, "using managed identity");
            std::env::set_var(AZURE_CLIENT_ID_ENV, id);
            id.to_string()
        }
    });
    ensure_identity(Some(active), id)
}

fn ensure_identity(active: Option<&str>, requested: &str) -> crate::error::Result<()> {
    match active {
        Some(active) if active == requested => Ok(()),
        active => Err(KeepError::Identity {
            requested: requested.to_string(),
            active: active.map(str::to_string),
        }),
    }
}

/// Azure Blob Storage backend using OpenDAL
pub struct AzureBlobFs {
    operator: Operator,
    location: ContainerLocation,
    upload_buffer: usize,
}

impl AzureBlobFs {
    /// Create a backend that authenticates through the Azure credential chain
    ///
    /// No account key or SAS token is ever set, so OpenDAL falls back to:
    /// 1. Workload identity (AZURE_CLIENT_ID + AZURE_FEDERATED_TOKEN_FILE)
    /// 2. Managed identity via the instance metadata service
    pub fn new_with_managed_identity(
        location: &ContainerLocation,
        upload_buffer: usize,
    ) -> Result<Self> {
        let mut builder = Azblob::default()
            .endpoint(&location.endpoint)
            .container(&location.container);
        if let Some(root) = &location.root {
            builder = builder.root(&format!("/{}/", root));
        }

        let operator = Operator::new(builder)?.finish();

        Ok(Self::from_operator(operator, location.clone(), upload_buffer))
    }

    /// Wrap an already configured operator
    pub fn from_operator(operator: Operator, location: ContainerLocation, upload_buffer: usize) -> Self {
        Self {
            operator,
            location,
            upload_buffer: upload_buffer.max(TRANSFER_BUFFER),
        }
    }

    fn object_from(key: &str, meta: &Metadata) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            size: meta.content_length(),
            modified: meta
                .last_modified()
                .and_then(|t| parse_timestamp(&t.to_string())),
            content_hash: stored_hash(meta),
            content_type: meta.content_type().map(str::to_string),
        }
    }

    /// Whole file contents, read into memory when small and mapped otherwise
    async fn upload_body(&self, local_path: &Path) -> Result<Bytes> {
        let size = tokio::fs::metadata(local_path)
            .await
            .context("Failed to read local file metadata")?
            .len();
        check_single_upload(size)?;

        if size <= self.upload_buffer as u64 {
            let data = tokio::fs::read(local_path)
                .await
                .context("Failed to read local file")?;
            return Ok(Bytes::from(data));
        }

        let file = tokio::fs::File::open(local_path)
            .await
            .context("Failed to open local file")?
            .into_std()
            .await;
        // The mapping is read-only; the file must not be truncated during the upload
        let map = unsafe { Mmap::map(&file) }.context("Failed to map local file")?;
        Ok(Bytes::from_owner(map))
    }
}

/// Put Block List commits drop user metadata, so every upload is one Put Blob
fn check_single_upload(size: u64) -> Result<()> {
    if size > MAX_SINGLE_UPLOAD {
        anyhow::bail!(
            "File is {} bytes; uploads larger than {} bytes cannot carry a content hash",
            size,
            MAX_SINGLE_UPLOAD
        );
    }
    Ok(())
}

/// Our own tag wins; the service-computed Content-MD5 is the fallback
fn stored_hash(meta: &Metadata) -> Option<ContentHash> {
    meta.user_metadata()
        .and_then(|m| m.get(CONTENT_MD5_METADATA))
        .and_then(|v| ContentHash::from_base64(v))
        .or_else(|| meta.content_md5().and_then(ContentHash::from_base64))
}

/// Accepts RFC 3339 as well as chrono's default `Display` rendering
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f UTC")
        .ok()
        .map(|t| t.and_utc())
}

#[async_trait]
impl BlobStore for AzureBlobFs {
    async fn exists(&self, key: &str) -> Result<bool> {
        let key = key.trim_start_matches('/');
        self.operator
            .exists(key)
            .await
            .context("Failed to check blob existence")
    }

    async fn properties(&self, key: &str) -> Result<RemoteObject> {
        let key = key.trim_start_matches('/');
        let meta = self
            .operator
            .stat(key)
            .await
            .context("Failed to fetch blob properties")?;
        Ok(Self::object_from(key, &meta))
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        media_type: &str,
        hash: ContentHash,
    ) -> Result<()> {
        let key = key.trim_start_matches('/');
        let cap = self.operator.info().full_capability();
        let body = self.upload_body(local_path).await?;

        // A single write call goes out as one Put Blob with its metadata attached
        let mut request = self.operator.write_with(key, body);
        if cap.write_with_content_type {
            request = request.content_type(media_type);
        }
        if cap.write_with_user_metadata {
            request = request.user_metadata([(
                CONTENT_MD5_METADATA.to_string(),
                hash.to_base64(),
            )]);
        }
        request
            .await
            .context("Failed to upload to Azure Blob Storage")?;

        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let key = key.trim_start_matches('/');

        let size = self
            .operator
            .stat(key)
            .await
            .context("Failed to fetch blob properties")?
            .content_length();
        let reader = self
            .operator
            .reader(key)
            .await
            .context("Failed to open blob reader")?;

        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create local directory")?;
            }
        }
        let mut file = tokio::fs::File::create(local_path)
            .await
            .context("Failed to create local file")?;

        let mut offset = 0u64;
        while offset < size {
            let end = (offset + TRANSFER_BUFFER as u64).min(size);
            let chunk = reader
                .read(offset..end)
                .await
                .context("Failed to download from Azure Blob Storage")?;
            if chunk.len() == 0 {
                anyhow::bail!("Blob ended after {} of {} bytes", offset, size);
            }
            file.write_all(&chunk.to_vec())
                .await
                .context("Failed to write local file")?;
            offset += chunk.len() as u64;
        }
        file.flush().await.context("Failed to write local file")?;
        file.sync_all().await.context("Failed to write local file")?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix = prefix.trim_start_matches('/');
        // List from the deepest directory covering the prefix, then filter
        let dir = list_root(prefix);

        let entries = self
            .operator
            .list_with(&dir)
            .recursive(true)
            .await
            .context("Failed to list Azure Blob container")?;

        let result = entries
            .iter()
            .filter(|entry| !entry.metadata().mode().is_dir())
            .filter(|entry| entry.path().starts_with(prefix))
            .map(|entry| Self::object_from(entry.path(), entry.metadata()))
            .collect();

        Ok(result)
    }

    fn display_path(&self, key: &str) -> String {
        format!("{}/{}/{}", self.location.endpoint, self.location.container, self.location.qualify(key))
    }
}

/// `a/b/c` -> `a/b/`, `a/b/` -> `a/b/`, `a` -> ``
fn list_root(prefix: &str) -> String {
    match prefix.rsplit_once('/') {
        Some((dir, _)) => format!("{}/", dir),
        None => String::new(),
    }
}

/// Connects to Azure containers as the configured managed identity
#[derive(Debug, Clone)]
pub struct AzureConnector {
    managed_identity_id: Option<String>,
    upload_buffer: usize,
}

impl AzureConnector {
    /// The identity must already be active, see [`export_managed_identity`]
    pub fn new(managed_identity_id: Option<String>, upload_buffer: usize) -> Self {
        Self {
            managed_identity_id,
            upload_buffer,
        }
    }
}

impl StoreConnector for AzureConnector {
    fn connect(&self, location: &ContainerLocation) -> Result<Arc<dyn BlobStore>> {
        if let Some(id) = &self.managed_identity_id {
            ensure_identity(ACTIVE_IDENTITY.get().map(String::as_str), id)?;
        }
        let store = AzureBlobFs::new_with_managed_identity(location, self.upload_buffer)
            .with_context(|| format!("Failed to configure Azure Blob client for {}", location))?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::services::Memory;
    use opendal::EntryMode;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn test_location() -> ContainerLocation {
        ContainerLocation {
            endpoint: "https://acct.blob.core.windows.net".to_string(),
            container: "test".to_string(),
            root: None,
        }
    }

    fn memory_store(upload_buffer: usize) -> AzureBlobFs {
        let operator = Operator::new(Memory::default()).unwrap().finish();
        AzureBlobFs::from_operator(operator, test_location(), upload_buffer)
    }

    fn temp_file(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    /// Deterministic bytes that differ from block to block
    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2024-01-02T03:04:05Z").unwrap();
        let chrono_display = parse_timestamp("2024-01-02 03:04:05 UTC").unwrap();
        assert_eq!(rfc, chrono_display);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_display_path_includes_root() {
        let location = ContainerLocation {
            endpoint: "https://acct.blob.core.windows.net".to_string(),
            container: "data".to_string(),
            root: Some("raw".to_string()),
        };
        let operator = Operator::new(Memory::default()).unwrap().finish();
        let store = AzureBlobFs::from_operator(operator, location, UPLOAD_BUFFER_SIZE);
        assert_eq!(
            store.display_path("a.csv"),
            "https://acct.blob.core.windows.net/data/raw/a.csv"
        );
    }

    #[test]
    fn test_stored_hash_prefers_user_metadata() {
        let tag = ContentHash::of(b"tagged");
        let native = ContentHash::of(b"native");
        let user = HashMap::from([(CONTENT_MD5_METADATA.to_string(), tag.to_base64())]);

        let meta = Metadata::new(EntryMode::FILE)
            .with_content_md5(native.to_base64())
            .with_user_metadata(user);
        assert_eq!(stored_hash(&meta), Some(tag));
    }

    #[test]
    fn test_stored_hash_falls_back_to_content_md5() {
        let native = ContentHash::of(b"native");

        let meta = Metadata::new(EntryMode::FILE).with_content_md5(native.to_base64());
        assert_eq!(stored_hash(&meta), Some(native));

        let garbled = HashMap::from([(CONTENT_MD5_METADATA.to_string(), "not base64!".to_string())]);
        let meta = Metadata::new(EntryMode::FILE)
            .with_content_md5(native.to_base64())
            .with_user_metadata(garbled);
        assert_eq!(stored_hash(&meta), Some(native));

        assert_eq!(stored_hash(&Metadata::new(EntryMode::FILE)), None);
    }

    #[test]
    fn test_list_root() {
        assert_eq!(list_root("a/b/c"), "a/b/");
        assert_eq!(list_root("a/b/"), "a/b/");
        assert_eq!(list_root("a"), "");
        assert_eq!(list_root(""), "");
    }

    #[test]
    fn test_single_upload_limit() {
        assert!(check_single_upload(0).is_ok());
        assert!(check_single_upload(MAX_SINGLE_UPLOAD).is_ok());
        let err = check_single_upload(MAX_SINGLE_UPLOAD + 1).unwrap_err();
        assert!(err.to_string().contains("content hash"));
    }

    #[test]
    fn test_ensure_identity() {
        assert!(ensure_identity(Some("client-a"), "client-a").is_ok());

        let err = ensure_identity(Some("client-a"), "client-b").unwrap_err();
        assert!(matches!(
            &err,
            KeepError::Identity { requested, active: Some(active) }
                if requested == "client-b" && active == "client-a"
        ));

        let err = ensure_identity(None, "client-b").unwrap_err();
        assert!(matches!(err, KeepError::Identity { active: None, .. }));
    }

    #[test]
    fn test_connector_refuses_identity_that_was_never_exported() {
        let connector = AzureConnector::new(
            Some("00000000-never-exported".to_string()),
            UPLOAD_BUFFER_SIZE,
        );
        let err = connector.connect(&test_location()).err().unwrap();
        assert!(err.to_string().contains("00000000-never-exported"));
    }

    #[tokio::test]
    async fn test_upload_then_download_roundtrip() {
        let store = memory_store(UPLOAD_BUFFER_SIZE);
        let file = temp_file(b"a,b\n1,2\n");
        let hash = ContentHash::of(b"a,b\n1,2\n");

        assert!(!store.exists("reports/a.csv").await.unwrap());
        store
            .upload(file.path(), "reports/a.csv", "text/csv", hash)
            .await
            .unwrap();
        assert!(store.exists("reports/a.csv").await.unwrap());
        assert_eq!(store.properties("reports/a.csv").await.unwrap().size, 8);

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/a.csv");
        store.download("reports/a.csv", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_roundtrip_larger_than_buffer() {
        let store = memory_store(TRANSFER_BUFFER);
        let data = patterned(3 * TRANSFER_BUFFER + 17);
        let file = temp_file(&data);

        store
            .upload(file.path(), "big.bin", "application/octet-stream", ContentHash::of(&data))
            .await
            .unwrap();
        assert_eq!(
            store.properties("big.bin").await.unwrap().size,
            data.len() as u64
        );

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("big.bin");
        store.download("big.bin", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let store = memory_store(UPLOAD_BUFFER_SIZE);
        for key in ["a/1", "ab/2", "a/b/3"] {
            store.operator.write(key, key.as_bytes().to_vec()).await.unwrap();
        }

        let keys = |objects: Vec<RemoteObject>| {
            let mut keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
            keys.sort();
            keys
        };

        assert_eq!(keys(store.list("a/").await.unwrap()), vec!["a/1", "a/b/3"]);
        assert_eq!(keys(store.list("a").await.unwrap()), vec!["a/1", "a/b/3", "ab/2"]);
        assert_eq!(keys(store.list("a/b/").await.unwrap()), vec!["a/b/3"]);
        assert_eq!(keys(store.list("/a/b").await.unwrap()), vec!["a/b/3"]);
        assert_eq!(keys(store.list("").await.unwrap()), vec!["a/1", "a/b/3", "ab/2"]);
        assert!(store.list("zz/").await.unwrap().is_empty());
    }

    // ========== wire format against a recording endpoint ==========

    #[derive(Debug, Clone)]
    struct RecordedRequest {
        method: String,
        target: String,
        headers: Vec<(String, String)>,
        body_len: usize,
    }

    impl RecordedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        }
    }

    /// Accepts every request with 201 Created and records what was sent
    async fn recording_endpoint() -> (String, Arc<Mutex<Vec<RecordedRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_connection(socket, log.clone()));
            }
        });
        (endpoint, requests)
    }

    async fn serve_connection(socket: TcpStream, log: Arc<Mutex<Vec<RecordedRequest>>>) {
        let mut reader = BufReader::new(socket);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let mut parts = line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();

            let mut headers = Vec::new();
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                    return;
                }
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
                }
            }

            let body_len = headers
                .iter()
                .find(|(n, _)| n == "content-length")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0);
            let mut body = vec![0u8; body_len];
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }

            log.lock().unwrap().push(RecordedRequest {
                method,
                target,
                headers,
                body_len,
            });
            let response = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
            if reader.get_mut().write_all(response).await.is_err() {
                return;
            }
        }
    }

    async fn recorded_upload(data: &[u8]) -> (ContentHash, Vec<RecordedRequest>) {
        let (endpoint, requests) = recording_endpoint().await;
        let builder = Azblob::default()
            .endpoint(&endpoint)
            .container("c")
            .account_name("acct")
            .account_key("a2V5");
        let operator = Operator::new(builder).unwrap().finish();
        let location = ContainerLocation {
            endpoint,
            container: "c".to_string(),
            root: None,
        };
        let store = AzureBlobFs::from_operator(operator, location, TRANSFER_BUFFER);

        let file = temp_file(data);
        let hash = ContentHash::of(data);
        store
            .upload(file.path(), "big.csv", "text/csv", hash)
            .await
            .unwrap();

        let recorded = requests.lock().unwrap().clone();
        (hash, recorded)
    }

    #[tokio::test]
    async fn test_small_upload_is_one_tagged_put() {
        let data = patterned(TRANSFER_BUFFER / 2);
        let (hash, requests) = recorded_upload(&data).await;

        assert_eq!(requests.len(), 1, "{requests:?}");
        let put = &requests[0];
        assert_eq!(put.method, "PUT");
        assert_eq!(put.target, "/c/big.csv");
        assert_eq!(put.header("x-ms-meta-content_md5"), Some(hash.to_base64().as_str()));
        assert_eq!(put.body_len, data.len());
    }

    #[tokio::test]
    async fn test_upload_larger_than_buffer_keeps_hash_tag() {
        let data = patterned(3 * TRANSFER_BUFFER + 17);
        let (hash, requests) = recorded_upload(&data).await;

        assert!(
            requests.iter().all(|r| !r.target.contains("comp=block")),
            "{requests:?}"
        );
        assert_eq!(requests.len(), 1, "{requests:?}");
        let put = &requests[0];
        assert_eq!(put.method, "PUT");
        assert_eq!(put.target, "/c/big.csv");
        assert_eq!(put.header("x-ms-meta-content_md5"), Some(hash.to_base64().as_str()));
        assert_eq!(put.header("content-type"), Some("text/csv"));
        assert_eq!(put.body_len, data.len());
    }
}
