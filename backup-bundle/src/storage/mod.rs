//! Storage collaborators that physically keep backup objects.
//!
//! The engine only needs a handful of operations: stream an object up, copy
//! an object server-side, read objects back and list them by prefix.

pub mod fs;
pub mod http;

use crate::utils::Result;
use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

pub use fs::FsStorage;
pub use http::HttpStorage;

/// Root prefix under which base backups are stored
pub const BASE_BACKUP_PATH: &str = "basebackups_005";

/// Suffix of the manifest object written when a backup completes
pub const MANIFEST_SUFFIX: &str = "_backup_stop_sentinel.json";

/// Directory holding a backup's archive partitions
pub const TAR_PARTITIONS: &str = "tar_partitions";

/// Byte source handed to [`Storage::upload`]
pub type UploadReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `size` bytes read from `reader` under `key`
    async fn upload(&self, key: &str, reader: UploadReader, size: u64) -> Result<()>;

    /// Server-side copy of an existing object
    async fn copy_entry(&self, from: &str, to: &str) -> Result<()>;

    /// Read a whole (small) object
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Stream an object into a local file
    async fn download_to(&self, key: &str, dest: &Path) -> Result<()>;

    /// Keys directly or transitively under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Convenience wrapper for in-memory payloads
    async fn upload_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len() as u64;
        self.upload(key, Box::pin(std::io::Cursor::new(data)), size)
            .await
    }
}

/// `basebackups_005/<backup>`
pub fn backup_prefix(backup_name: &str) -> String {
    format!("{}/{}", BASE_BACKUP_PATH, backup_name)
}

/// `basebackups_005/<backup>/tar_partitions`
pub fn partition_prefix(backup_name: &str) -> String {
    format!("{}/{}", backup_prefix(backup_name), TAR_PARTITIONS)
}

/// `basebackups_005/<backup>/tar_partitions/<archive>`
pub fn partition_key(backup_name: &str, archive_name: &str) -> String {
    format!("{}/{}", partition_prefix(backup_name), archive_name)
}

/// `basebackups_005/<backup>_backup_stop_sentinel.json`
pub fn manifest_key(backup_name: &str) -> String {
    format!("{}/{}{}", BASE_BACKUP_PATH, backup_name, MANIFEST_SUFFIX)
}

/// Backup name from a manifest key, if `key` is one
pub fn backup_name_from_manifest_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(BASE_BACKUP_PATH)?.strip_prefix('/')?;
    let name = rest.strip_suffix(MANIFEST_SUFFIX)?;
    if name.is_empty() || name.contains('/') {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(backup_prefix("base_1"), "basebackups_005/base_1");
        assert_eq!(
            partition_key("base_1", "part_001.tar.zst"),
            "basebackups_005/base_1/tar_partitions/part_001.tar.zst"
        );
        assert_eq!(
            manifest_key("base_1"),
            "basebackups_005/base_1_backup_stop_sentinel.json"
        );
    }

    #[test]
    fn test_backup_name_from_manifest_key() {
        assert_eq!(
            backup_name_from_manifest_key("basebackups_005/base_1_backup_stop_sentinel.json"),
            Some("base_1")
        );
        assert_eq!(
            backup_name_from_manifest_key("basebackups_005/base_1/tar_partitions/part_001.tar.zst"),
            None
        );
        assert_eq!(backup_name_from_manifest_key("wal_005/0001"), None);
    }
}
