// Content hash computation
// Streams files through MD5 in fixed-size chunks so memory use stays flat

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use crate::error::{KeepError, Result};

/// Read size used when hashing a file (1 MiB)
pub const HASH_CHUNK_SIZE: usize = 1 << 20;

/// 128-bit MD5 digest of a file's content.
///
/// Blob services store this as base64 in `Content-MD5`; it is displayed as
/// lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hash an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = StreamingHash::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Decode the `Content-MD5` form; `None` unless it is exactly 16 bytes
    pub fn from_base64(encoded: &str) -> Option<Self> {
        let bytes = STANDARD.decode(encoded.trim()).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn from_hex(encoded: &str) -> Option<Self> {
        let bytes = hex::decode(encoded.trim()).ok()?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

/// Incremental MD5 over data arriving in pieces
pub struct StreamingHash(Md5);

impl StreamingHash {
    pub fn new() -> Self {
        Self(Md5::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    pub fn finish(self) -> ContentHash {
        let digest = self.0.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        ContentHash(bytes)
    }
}

impl Default for StreamingHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash, size and modification time of a local file.
///
/// Never persisted; recomputed on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileDescriptor {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Hash a file with the default 1 MiB chunk size.
pub fn hash_file(path: &Path) -> Result<LocalFileDescriptor> {
    hash_file_chunked(path, HASH_CHUNK_SIZE)
}

/// Hash a file, reading `chunk_size` bytes at a time.
pub fn hash_file_chunked(path: &Path, chunk_size: usize) -> Result<LocalFileDescriptor> {
    let mut file =
        File::open(path).map_err(|e| KeepError::from_io_error(e, "opening", path))?;

    let mut hasher = StreamingHash::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| KeepError::from_io_error(e, "reading", path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    // Stat after reading so size and mtime describe the bytes just hashed
    let metadata = file
        .metadata()
        .map_err(|e| KeepError::from_io_error(e, "reading metadata of", path))?;

    Ok(LocalFileDescriptor {
        path: path.to_path_buf(),
        hash: hasher.finish(),
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// Hash a file on the blocking thread pool.
pub async fn hash_file_async(path: &Path, chunk_size: usize) -> Result<LocalFileDescriptor> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_chunked(&owned, chunk_size))
        .await
        .map_err(|e| KeepError::from_io_error(std::io::Error::other(e), "hashing", path))?
}
