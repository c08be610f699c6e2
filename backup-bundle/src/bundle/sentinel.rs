//! Control file capture.
//!
//! The control file and the label files are read on the walk task itself,
//! without awaiting anything, so their capture never depends on how far the
//! packing workers have got.

use crate::fs::classify::SENTINEL_NAME;
use crate::fs::metadata::{modified_time, permission_bits};
use crate::utils::{BundleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;

/// Identity of the captured control file, as stored in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
}

/// A small file read whole during the walk and packed into the control
/// archive at the end
#[derive(Debug, Clone)]
pub struct CapturedFile {
    pub rel_path: String,
    pub metadata: Metadata,
    pub content: Vec<u8>,
}

impl CapturedFile {
    pub fn read(path: &Path, rel_path: &str, metadata: &Metadata) -> Result<Self> {
        let content = std::fs::read(path).map_err(|e| BundleError::walk(path, e))?;
        Ok(Self {
            rel_path: rel_path.to_string(),
            metadata: metadata.clone(),
            content,
        })
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct Sentinel {
    pub info: SentinelInfo,
    pub file: CapturedFile,
}

impl Sentinel {
    pub fn capture(path: &Path, rel_path: &str, metadata: &Metadata) -> Result<Self> {
        let file = CapturedFile::read(path, rel_path, metadata)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| SENTINEL_NAME.to_string());

        let info = SentinelInfo {
            name,
            path: rel_path.to_string(),
            size: file.size(),
            mode: permission_bits(metadata),
            mtime: modified_time(metadata),
        };
        Ok(Self { info, file })
    }
}
