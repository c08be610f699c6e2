//! Per-file metadata tracking.
//!
//! Workers insert concurrently while the walk runs; snapshots are taken only
//! once the bundle has finished its queue. The no-op variants disable
//! tracking entirely.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Description of one file of a backup, keyed by its relative path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescription {
    pub mtime: DateTime<Utc>,

    pub size: u64,

    /// Stored as a block-level increment against the delta base
    #[serde(default)]
    pub is_incremented: bool,

    /// Unchanged since the delta base; no bytes in this backup
    #[serde(default)]
    pub is_skipped: bool,

    /// Archive holding the file's bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

pub trait BundleFiles: Send + Sync {
    fn add_file(&self, path: &str, description: FileDescription);

    fn snapshot(&self) -> BTreeMap<String, FileDescription>;

    fn is_tracking(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct RegularBundleFiles {
    files: DashMap<String, FileDescription>,
}

impl RegularBundleFiles {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleFiles for RegularBundleFiles {
    fn add_file(&self, path: &str, description: FileDescription) {
        self.files.insert(path.to_string(), description);
    }

    fn snapshot(&self) -> BTreeMap<String, FileDescription> {
        self.files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn is_tracking(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct NopBundleFiles;

impl BundleFiles for NopBundleFiles {
    fn add_file(&self, _path: &str, _description: FileDescription) {}

    fn snapshot(&self) -> BTreeMap<String, FileDescription> {
        BTreeMap::new()
    }

    fn is_tracking(&self) -> bool {
        false
    }
}

/// Archive name -> files it holds, in packing order
pub trait TarFileSets: Send + Sync {
    fn add_file(&self, archive: &str, path: &str);

    fn add_files(&self, archive: &str, paths: &[String]);

    fn snapshot(&self) -> BTreeMap<String, Vec<String>>;

    fn is_tracking(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct RegularTarFileSets {
    sets: DashMap<String, Vec<String>>,
}

impl RegularTarFileSets {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TarFileSets for RegularTarFileSets {
    fn add_file(&self, archive: &str, path: &str) {
        self.sets
            .entry(archive.to_string())
            .or_default()
            .push(path.to_string());
    }

    fn add_files(&self, archive: &str, paths: &[String]) {
        self.sets
            .entry(archive.to_string())
            .or_default()
            .extend(paths.iter().cloned());
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.sets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn is_tracking(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct NopTarFileSets;

impl TarFileSets for NopTarFileSets {
    fn add_file(&self, _archive: &str, _path: &str) {}

    fn add_files(&self, _archive: &str, _paths: &[String]) {}

    fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }

    fn is_tracking(&self) -> bool {
        false
    }
}
