//! Configuration for the bundling engine.
//!
//! Loaded from a TOML file; command line flags are folded on top of it by
//! the binary before anything runs.

use crate::composer::ComposerKind;
use crate::queue::compression::DEFAULT_COMPRESSION_LEVEL;
use crate::queue::{Compression, DEFAULT_TAR_SIZE_THRESHOLD, DEFAULT_UPLOAD_CONCURRENCY};
use crate::storage::{FsStorage, HttpStorage, Storage};
use crate::utils::{BundleError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bundle: BundleSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSettings {
    /// Uncompressed bytes after which an archive is rotated
    #[serde(default = "default_tar_size_threshold")]
    pub tar_size_threshold: u64,

    /// Concurrent archive writers
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Compression algorithm (zstd, none)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Directory for spooled archives; system temp dir if unset
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSettings {
    #[serde(default)]
    pub composer: ComposerKind,

    #[serde(default)]
    pub without_files_metadata: bool,

    /// JSON file mapping relative paths to update counts
    #[serde(default)]
    pub rating_stats: Option<PathBuf>,

    #[serde(default)]
    pub delta_from_name: Option<String>,

    #[serde(default)]
    pub delta_from_user_data: Option<String>,

    #[serde(default)]
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Fs,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub kind: StorageKind,

    /// Root directory for `fs` storage
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Backup server URL for `http` storage
    #[serde(default)]
    pub url: String,

    /// Pre-shared key or JWT token
    #[serde(default)]
    pub token: String,

    /// Server-side namespace the keys live under
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_tar_size_threshold() -> u64 {
    DEFAULT_TAR_SIZE_THRESHOLD
}

fn default_upload_concurrency() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/backup-bundle/storage")
}

fn default_namespace() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-bundle".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BundleSettings {
    fn default() -> Self {
        Self {
            tar_size_threshold: default_tar_size_threshold(),
            upload_concurrency: default_upload_concurrency(),
            compression: default_compression(),
            compression_level: default_compression_level(),
            spool_dir: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::Fs,
            path: default_storage_path(),
            url: String::new(),
            token: String::new(),
            namespace: default_namespace(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl BundleSettings {
    pub fn compression(&self) -> Result<Compression> {
        Compression::from_config(&self.compression, self.compression_level)
    }
}

impl StorageSettings {
    pub fn open(&self) -> Result<Arc<dyn Storage>> {
        match self.kind {
            StorageKind::Fs => Ok(Arc::new(FsStorage::new(&self.path))),
            StorageKind::Http => {
                if self.url.is_empty() {
                    return Err(BundleError::Config(
                        "storage.url is required for http storage".to_string(),
                    ));
                }
                Ok(Arc::new(
                    HttpStorage::new(&self.url, &self.namespace).with_token(&self.token),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bundle]
            tar_size_threshold = 1048576

            [backup]
            composer = "rating"
            "#,
        )
        .unwrap();

        assert_eq!(config.bundle.tar_size_threshold, 1 << 20);
        assert_eq!(config.bundle.upload_concurrency, DEFAULT_UPLOAD_CONCURRENCY);
        assert_eq!(config.backup.composer, ComposerKind::Rating);
        assert!(matches!(config.storage.kind, StorageKind::Fs));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_http_storage_requires_url() {
        let settings = StorageSettings {
            kind: StorageKind::Http,
            ..StorageSettings::default()
        };
        assert!(matches!(settings.open(), Err(BundleError::Config(_))));
    }

    #[test]
    fn test_compression_setting() {
        let mut settings = BundleSettings::default();
        assert_eq!(settings.compression().unwrap(), Compression::default());
        settings.compression = "none".to_string();
        assert_eq!(settings.compression().unwrap(), Compression::None);
    }
}
