//! Single-pass directory traversal of the data directory.
//!
//! Entries come out depth first, sorted by file name within each directory,
//! without following symlinks. The caller decides per entry whether to
//! descend, which keeps excluded directories from being read at all.

use crate::utils::{BundleError, Result};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// One entry discovered during walking
#[derive(Debug, Clone)]
pub struct WalkedEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Metadata of the entry itself (symlinks are not resolved)
    pub metadata: Metadata,
}

impl WalkedEntry {
    fn from_entry(entry: &DirEntry) -> Result<Self> {
        Ok(Self {
            path: entry.path().to_path_buf(),
            metadata: entry.metadata()?,
        })
    }
}

/// Walk driver over a data directory
pub struct DataDirWalker {
    inner: walkdir::IntoIter,
}

impl DataDirWalker {
    pub fn new(root: &Path) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        Self { inner }
    }

    /// Do not descend into the directory yielded last
    pub fn skip_current_dir(&mut self) {
        self.inner.skip_current_dir();
    }
}

impl Iterator for DataDirWalker {
    type Item = Result<WalkedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(BundleError::from(e))),
        };
        Some(WalkedEntry::from_entry(&entry))
    }
}
