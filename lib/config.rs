//! Module for cache configuration settings.
//!
//! User configurations may be specified in a configuration file; the cache
//! itself is constructed from the three values it actually consumes rather
//! than from this type.

use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn blobfs_cache_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(|| PathBuf::from("/tmp/blobfs/cache"), |d| d.join("blobfs"))
}

fn default_capacity() -> ByteSize {
    ByteSize::mib(512)
}

fn default_disk_cache_directory() -> PathBuf {
    blobfs_cache_dir().join("data")
}

fn default_disk_safe_threshold() -> ByteSize {
    ByteSize::mib(256)
}

/// The cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Byte budget for the memory tier. Writes exceeding it trigger eviction.
    pub capacity: ByteSize,

    /// Filesystem path spilled pages are written under.
    pub disk_cache_directory: PathBuf,

    /// Minimum free bytes demanded at the disk cache directory before a
    /// spill is allowed.
    pub disk_safe_threshold: ByteSize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            disk_cache_directory: default_disk_cache_directory(),
            disk_safe_threshold: default_disk_safe_threshold(),
        }
    }
}

/// Errors raised while loading a [`CacheConfig`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file failed validation.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The configuration file was not valid TOML for this schema.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CacheConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.capacity.as_u64() == 0 {
            errors.push("Cache capacity must not be zero.".to_owned());
        }

        if self.disk_cache_directory.as_os_str().is_empty() {
            errors.push("Disk cache directory must not be empty.".to_owned());
        } else if self.disk_cache_directory.parent().is_none() {
            errors.push(format!(
                "Disk cache directory '{}' has no parent directory.",
                self.disk_cache_directory.display()
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Loads a validated config from a single TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading cache configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
