//! Backup level operations: push a data directory, fetch it back, list.

pub mod fetch;
pub mod push;
pub mod selector;

use crate::bundle::manifest::BackupManifest;
use crate::storage::{backup_name_from_manifest_key, manifest_key, Storage, BASE_BACKUP_PATH};
use crate::utils::Result;
use tracing::warn;

pub use fetch::fetch_backup;
pub use push::{push_backup, PushArguments};
pub use selector::BackupSelector;

/// Every readable manifest in storage, oldest first
pub async fn list_backups(storage: &dyn Storage) -> Result<Vec<BackupManifest>> {
    let keys = storage.list(BASE_BACKUP_PATH).await?;
    let mut manifests = Vec::new();

    for key in &keys {
        let Some(name) = backup_name_from_manifest_key(key) else {
            continue;
        };
        let data = storage.read(&manifest_key(name)).await?;
        match serde_json::from_slice::<BackupManifest>(&data) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!("Ignoring unreadable manifest {}: {}", key, e),
        }
    }

    manifests.sort_by(|a, b| a.finish_time.cmp(&b.finish_time).then_with(|| a.name.cmp(&b.name)));
    Ok(manifests)
}
