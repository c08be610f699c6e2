//! Resolving one stored backup from a name, a user data tag or "latest".

use super::list_backups;
use crate::bundle::manifest::BackupManifest;
use crate::storage::Storage;
use crate::utils::{BundleError, Result};
use tracing::info;

/// Name accepted on the command line for the most recent backup
pub const LATEST: &str = "LATEST";

#[derive(Debug, Clone, PartialEq)]
pub enum BackupSelector {
    Latest,
    ByName(String),
    ByUserData(serde_json::Value),
}

impl BackupSelector {
    /// `LATEST` or a backup name
    pub fn from_name(name: &str) -> Self {
        if name == LATEST {
            BackupSelector::Latest
        } else {
            BackupSelector::ByName(name.to_string())
        }
    }

    /// User data given as JSON, or as a plain string otherwise
    pub fn from_user_data(raw: &str) -> Self {
        BackupSelector::ByUserData(parse_user_data(raw))
    }

    /// Exactly one matching backup
    pub async fn select(&self, storage: &dyn Storage) -> Result<BackupManifest> {
        let backups = list_backups(storage).await?;

        let manifest = match self {
            BackupSelector::Latest => backups
                .into_iter()
                .max_by_key(|m| m.finish_time)
                .ok_or_else(|| BundleError::NoSuchBackup("no backups found".to_string()))?,
            BackupSelector::ByName(name) => backups
                .into_iter()
                .find(|m| &m.name == name)
                .ok_or_else(|| BundleError::NoSuchBackup(name.clone()))?,
            BackupSelector::ByUserData(data) => {
                let mut matching: Vec<BackupManifest> =
                    backups.into_iter().filter(|m| m.has_user_data(data)).collect();
                match matching.len() {
                    0 => {
                        return Err(BundleError::NoSuchBackup(format!(
                            "no backup with user data {}",
                            data
                        )))
                    }
                    1 => matching.remove(0),
                    n => {
                        return Err(BundleError::AmbiguousSelection(format!(
                            "{} backups carry user data {}",
                            n, data
                        )))
                    }
                }
            }
        };

        info!("Selected backup {}", manifest.name);
        Ok(manifest)
    }
}

pub fn parse_user_data(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
