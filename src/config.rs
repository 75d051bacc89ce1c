//! blobkeep configuration (`config.toml`).
//!
//! Looked up at `<config dir>/blobkeep/config.toml`:
//! - Linux: `~/.config/blobkeep/config.toml`
//! - macOS: `~/Library/Application Support/blobkeep/config.toml`
//! - Windows: `%APPDATA%\blobkeep\config.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeepError, Result};
use crate::fs::azure::UPLOAD_BUFFER_SIZE;
use crate::hash::HASH_CHUNK_SIZE;

/// Config file name
pub const CONFIG_FILE: &str = "config.toml";

/// Overrides `managed_identity_id` when set
pub const MANAGED_IDENTITY_ENV: &str = "BLOBKEEP_MANAGED_IDENTITY_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepConfig {
    /// Client id of the managed identity used for every container.
    /// When unset the platform's default identity is used.
    pub managed_identity_id: Option<String>,

    /// Read size when hashing local files, at least 1 MiB
    pub hash_chunk_size: usize,

    /// Files up to this size are read into memory for upload; larger ones are memory-mapped
    pub upload_buffer_size: usize,
}

impl Default for KeepConfig {
    fn default() -> Self {
        Self {
            managed_identity_id: None,
            hash_chunk_size: HASH_CHUNK_SIZE,
            upload_buffer_size: UPLOAD_BUFFER_SIZE,
        }
    }
}

impl KeepConfig {
    /// Load from the platform config directory, then apply environment overrides.
    ///
    /// Returns the default config if no file exists.
    pub fn load() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Load from an explicit path. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| KeepError::from_io_error(e, "reading", path))?;
        let config = Self::parse(&content).map_err(|reason| KeepError::Config {
            path: path.to_path_buf(),
            reason,
        })?;

        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        let config: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.hash_chunk_size < HASH_CHUNK_SIZE {
            return Err(format!(
                "hash_chunk_size must be at least {} bytes, got {}",
                HASH_CHUNK_SIZE, self.hash_chunk_size
            ));
        }
        if self.upload_buffer_size == 0 {
            return Err("upload_buffer_size must be positive".to_string());
        }
        Ok(())
    }

    /// Apply `BLOBKEEP_MANAGED_IDENTITY_ID` if it is set and non-empty
    pub fn apply_env(&mut self) {
        if let Ok(id) = std::env::var(MANAGED_IDENTITY_ENV) {
            let id = id.trim();
            if !id.is_empty() {
                self.managed_identity_id = Some(id.to_string());
            }
        }
    }

    pub fn with_managed_identity(mut self, id: impl Into<String>) -> Self {
        self.managed_identity_id = Some(id.into());
        self
    }
}

/// Platform config file location, if the platform has a config directory
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("blobkeep").join(CONFIG_FILE))
}
