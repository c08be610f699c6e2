//! Directory-backed storage: every key is a file path under a root folder.

use super::{Storage, UploadReader};
use crate::utils::{BundleError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of `key`; rejects keys escaping the root
    pub fn path_of(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BundleError::Storage(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn upload(&self, key: &str, mut reader: UploadReader, size: u64) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename, so readers never see a partial object
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        let mut file = tokio::fs::File::create(&partial).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written != size {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(BundleError::Storage(format!(
                "short upload for {}: expected {} bytes, got {}",
                key, size, written
            )));
        }

        tokio::fs::rename(&partial, &path).await?;
        debug!("Stored {} ({} bytes)", key, written);
        Ok(())
    }

    async fn copy_entry(&self, from: &str, to: &str) -> Result<()> {
        let source = self.path_of(from)?;
        let target = self.path_of(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &target).await.map_err(|e| {
            BundleError::Storage(format!("failed to copy {} to {}: {}", from, to, e))
        })?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| BundleError::Storage(format!("failed to read {}: {}", key, e)))
    }

    async fn download_to(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.path_of(key)?;
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| BundleError::Storage(format!("failed to download {}: {}", key, e)))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.path_of(prefix)?;
        let root = self.root.clone();

        let keys = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !base.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&base).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(".partial") {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            Ok(keys)
        })
        .await??;

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_read_and_list() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let storage = FsStorage::new(temp_dir.path());

        storage
            .upload_bytes("basebackups_005/base_1/tar_partitions/part_001.tar", b"abc".to_vec())
            .await?;
        storage
            .upload_bytes("basebackups_005/base_1_backup_stop_sentinel.json", b"{}".to_vec())
            .await?;

        assert_eq!(
            storage
                .read("basebackups_005/base_1/tar_partitions/part_001.tar")
                .await?,
            b"abc"
        );

        let keys = storage.list("basebackups_005").await?;
        assert_eq!(
            keys,
            vec![
                "basebackups_005/base_1/tar_partitions/part_001.tar".to_string(),
                "basebackups_005/base_1_backup_stop_sentinel.json".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_entry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let storage = FsStorage::new(temp_dir.path());

        storage.upload_bytes("a/part_001.tar", b"payload".to_vec()).await?;
        storage.copy_entry("a/part_001.tar", "b/part_007.tar").await?;

        assert_eq!(storage.read("b/part_007.tar").await?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_short_upload_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let storage = FsStorage::new(temp_dir.path());

        let result = storage
            .upload("x/short", Box::pin(std::io::Cursor::new(b"ab".to_vec())), 10)
            .await;
        assert!(matches!(result, Err(BundleError::Storage(_))));
        assert!(storage.list("x").await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let storage = FsStorage::new("/tmp/storage-root");
        assert!(storage.path_of("../etc/passwd").is_err());
        assert!(storage.path_of("/abs").is_err());
        assert!(storage.path_of("basebackups_005/x").is_ok());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let storage = FsStorage::new(temp_dir.path());
        assert!(storage.list("basebackups_005").await?.is_empty());
        Ok(())
    }
}
