//! Backup manifest: the persisted record of a completed backup.
//!
//! Written as `basebackups_005/<name>_backup_stop_sentinel.json` once every
//! archive is stored. Restores use it to pick archives and decide which
//! files to materialize; delta backups use it as their base.

use super::sentinel::SentinelInfo;
use super::tracking::FileDescription;
use crate::composer::ComposerKind;
use crate::queue::SealedArchive;
use crate::utils::{BundleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub name: String,
    pub sentinel: SentinelInfo,

    /// Absent when metadata tracking was disabled for this backup
    #[serde(default)]
    pub files: Option<BTreeMap<String, FileDescription>>,

    #[serde(default)]
    pub tar_file_sets: Option<BTreeMap<String, Vec<String>>>,

    pub archives: Vec<SealedArchive>,
    pub composer: ComposerKind,

    /// Name of the backup this one is a delta of
    #[serde(default)]
    pub delta_base: Option<String>,

    pub compression: String,
    pub hostname: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,

    #[serde(default)]
    pub is_permanent: bool,

    #[serde(default)]
    pub user_data: Option<serde_json::Value>,

    pub total_files: usize,
    pub total_bytes: u64,
}

impl BackupManifest {
    /// Files whose bytes live in this backup's archives, or `None` when
    /// every archive entry should be restored
    pub fn files_to_unwrap(&self) -> Option<BTreeSet<String>> {
        self.files.as_ref().map(|files| {
            files
                .iter()
                .filter(|(_, desc)| !desc.is_skipped)
                .map(|(path, _)| path.clone())
                .collect()
        })
    }

    /// Files that must come from the delta base: skipped here, or stored as
    /// increments against it
    pub fn files_from_base(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .flatten()
            .filter(|(_, desc)| desc.is_skipped || desc.is_incremented)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Matches the opaque user data tag of a selection
    pub fn has_user_data(&self, data: &serde_json::Value) -> bool {
        self.user_data.as_ref() == Some(data)
    }
}

/// Prior backup used as a delta or copy base
#[derive(Debug, Clone, Default)]
pub struct BaseBackup {
    pub name: String,
    pub files: BTreeMap<String, FileDescription>,
    pub tar_file_sets: BTreeMap<String, Vec<String>>,
}

impl BaseBackup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fails when the backup was taken without metadata tracking
    pub fn from_manifest(manifest: &BackupManifest) -> Result<Self> {
        match (&manifest.files, &manifest.tar_file_sets) {
            (Some(files), Some(sets)) => Ok(Self {
                name: manifest.name.clone(),
                files: files.clone(),
                tar_file_sets: sets.clone(),
            }),
            _ => Err(BundleError::ComposerConfig(format!(
                "backup {} has no files metadata and cannot be used as a base",
                manifest.name
            ))),
        }
    }

    pub fn file(&self, path: &str) -> Option<&FileDescription> {
        self.files.get(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(size: u64, skipped: bool, incremented: bool) -> FileDescription {
        FileDescription {
            mtime: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            size,
            is_incremented: incremented,
            is_skipped: skipped,
            archive: if skipped {
                None
            } else {
                Some("part_001.tar.zst".to_string())
            },
        }
    }

    fn manifest(files: Option<BTreeMap<String, FileDescription>>) -> BackupManifest {
        let now = Utc::now();
        BackupManifest {
            version: MANIFEST_VERSION,
            name: "base_20240101T000000Z".to_string(),
            sentinel: SentinelInfo {
                name: "pg_control".to_string(),
                path: "global/pg_control".to_string(),
                size: 8192,
                mode: 0o600,
                mtime: now,
            },
            tar_file_sets: files.as_ref().map(|_| BTreeMap::new()),
            files,
            archives: Vec::new(),
            composer: ComposerKind::Regular,
            delta_base: None,
            compression: "zstd".to_string(),
            hostname: "db1".to_string(),
            start_time: now,
            finish_time: now,
            is_permanent: false,
            user_data: None,
            total_files: 0,
            total_bytes: 0,
        }
    }

    #[test]
    fn test_files_to_unwrap_excludes_skipped() {
        let mut files = BTreeMap::new();
        files.insert("base/1".to_string(), desc(10, false, false));
        files.insert("base/2".to_string(), desc(10, true, false));
        files.insert("base/3".to_string(), desc(10, false, true));
        let manifest = manifest(Some(files));

        let unwrap = manifest.files_to_unwrap().unwrap();
        assert!(unwrap.contains("base/1"));
        assert!(!unwrap.contains("base/2"));
        assert!(unwrap.contains("base/3"));

        let from_base = manifest.files_from_base();
        assert_eq!(
            from_base.into_iter().collect::<Vec<_>>(),
            vec!["base/2".to_string(), "base/3".to_string()]
        );
    }

    #[test]
    fn test_untracked_manifest() {
        let manifest = manifest(None);
        assert!(manifest.files_to_unwrap().is_none());
        assert!(manifest.files_from_base().is_empty());
        assert!(matches!(
            BaseBackup::from_manifest(&manifest),
            Err(BundleError::ComposerConfig(_))
        ));
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let mut files = BTreeMap::new();
        files.insert("base/1".to_string(), desc(10, false, false));
        let mut manifest = manifest(Some(files));
        manifest.user_data = Some(serde_json::json!({"env": "prod"}));

        let json = serde_json::to_vec(&manifest).unwrap();
        let parsed: BackupManifest = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.files, manifest.files);
        assert!(parsed.has_user_data(&serde_json::json!({"env": "prod"})));

        let base = BaseBackup::from_manifest(&parsed).unwrap();
        assert_eq!(base.file("base/1").map(|d| d.size), Some(10));
    }
}
