//! Packing strategies.
//!
//! A composer looks at one discovered file and decides where it goes and how
//! its bytes are stored. It never touches archives itself: the bundle turns
//! each [`PackDecision`] into queue work.

pub mod copy;
pub mod packer;
pub mod rating;
pub mod regular;

use crate::bundle::manifest::BaseBackup;
use crate::bundle::tracking::{
    BundleFiles, FileDescription, NopBundleFiles, NopTarFileSets, RegularBundleFiles,
    RegularTarFileSets, TarFileSets,
};
use crate::utils::{BundleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

pub use copy::CopyComposer;
pub use packer::FilePacker;
pub use rating::{RatingComposer, RelFileStatistics};
pub use regular::RegularComposer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    Full,
    /// Block-level increment against the delta base
    Incremental,
    /// No bytes in this backup
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Whichever archive is free
    NextFree,
    /// Packed after the walk together with the rest of its group
    Grouped(u32),
}

/// Base archive whose entry can be copied instead of repacked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReference {
    pub base_backup: String,
    pub archive: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackDecision {
    pub placement: Placement,
    pub mode: PackMode,
    pub copy_from: Option<CopyReference>,
}

impl PackDecision {
    pub fn next_free(mode: PackMode) -> Self {
        Self {
            placement: Placement::NextFree,
            mode,
            copy_from: None,
        }
    }
}

/// What a composer gets to see of a regular file
#[derive(Debug, Clone)]
pub struct ComposeFileInfo {
    pub path: PathBuf,
    pub rel_path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

impl ComposeFileInfo {
    /// Unchanged relative to a base description
    pub fn matches(&self, base: &FileDescription) -> bool {
        self.size == base.size && self.mtime == base.mtime
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposerKind {
    #[default]
    Regular,
    Rating,
    Copy,
}

impl fmt::Display for ComposerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComposerKind::Regular => "regular",
            ComposerKind::Rating => "rating",
            ComposerKind::Copy => "copy",
        };
        f.write_str(name)
    }
}

impl FromStr for ComposerKind {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "regular" | "" => Ok(ComposerKind::Regular),
            "rating" => Ok(ComposerKind::Rating),
            "copy" => Ok(ComposerKind::Copy),
            other => Err(BundleError::Config(format!("unknown composer: {}", other))),
        }
    }
}

pub trait TarBallComposer: Send + Sync {
    fn kind(&self) -> ComposerKind;

    fn decide(&self, file: &ComposeFileInfo) -> PackDecision;
}

/// Encoding of a changed file relative to its version in the delta base.
///
/// The byte layout is entirely up to the implementation; the engine only
/// stores the payload and hands it back on restore.
pub trait IncrementCodec: Send + Sync {
    fn encode(&self, path: &Path, base: &FileDescription) -> io::Result<Vec<u8>>;

    /// Rebuild `target` (holding the base version) from a payload
    fn apply(&self, target: &Path, payload: &[u8]) -> io::Result<()>;
}

#[derive(Clone, Default)]
pub struct FilePackOptions {
    pub delta_base: Option<Arc<BaseBackup>>,
    pub increment_codec: Option<Arc<dyn IncrementCodec>>,
}

impl FilePackOptions {
    pub fn with_delta_base(mut self, base: BaseBackup) -> Self {
        self.delta_base = Some(Arc::new(base));
        self
    }

    pub fn with_increment_codec(mut self, codec: Arc<dyn IncrementCodec>) -> Self {
        self.increment_codec = Some(codec);
        self
    }

    pub fn base_file(&self, rel_path: &str) -> Option<&FileDescription> {
        self.delta_base.as_ref()?.file(rel_path)
    }
}

/// A composer together with the trackers and options it was built for
pub struct ComposerSetup {
    pub composer: Arc<dyn TarBallComposer>,
    pub files: Arc<dyn BundleFiles>,
    pub tar_file_sets: Arc<dyn TarFileSets>,
    pub options: FilePackOptions,
    /// Backup whose archives the copy composer copies from
    pub copy_base: Option<Arc<BaseBackup>>,
}

pub struct ComposerMaker {
    kind: ComposerKind,
    options: FilePackOptions,
    statistics: RelFileStatistics,
    copy_base: Option<BaseBackup>,
    track_metadata: bool,
}

impl ComposerMaker {
    pub fn regular(options: FilePackOptions) -> Self {
        Self {
            kind: ComposerKind::Regular,
            options,
            statistics: RelFileStatistics::new(),
            copy_base: None,
            track_metadata: true,
        }
    }

    pub fn rating(statistics: RelFileStatistics, options: FilePackOptions) -> Self {
        Self {
            kind: ComposerKind::Rating,
            statistics,
            ..Self::regular(options)
        }
    }

    pub fn copy(base: Option<BaseBackup>, options: FilePackOptions) -> Self {
        Self {
            kind: ComposerKind::Copy,
            copy_base: base,
            ..Self::regular(options)
        }
    }

    /// Use no-op trackers
    pub fn without_files_metadata(mut self) -> Self {
        self.track_metadata = false;
        self
    }

    pub fn kind(&self) -> ComposerKind {
        self.kind
    }

    pub fn make(self) -> Result<ComposerSetup> {
        let (files, tar_file_sets): (Arc<dyn BundleFiles>, Arc<dyn TarFileSets>) =
            if self.track_metadata {
                (
                    Arc::new(RegularBundleFiles::new()),
                    Arc::new(RegularTarFileSets::new()),
                )
            } else {
                (Arc::new(NopBundleFiles), Arc::new(NopTarFileSets))
            };

        let mut copy_base = None;
        let composer: Arc<dyn TarBallComposer> = match self.kind {
            ComposerKind::Regular => Arc::new(RegularComposer::new(&self.options)),
            ComposerKind::Rating => {
                Arc::new(RatingComposer::new(self.statistics, &self.options))
            }
            ComposerKind::Copy => {
                if !self.track_metadata {
                    return Err(BundleError::ComposerConfig(
                        "copy composer requires files metadata tracking".to_string(),
                    ));
                }
                let base = self.copy_base.ok_or_else(|| {
                    BundleError::ComposerConfig(
                        "copy composer requires a previous backup to copy from".to_string(),
                    )
                })?;
                let base = Arc::new(base);
                copy_base = Some(Arc::clone(&base));
                Arc::new(CopyComposer::new(base))
            }
        };

        info!(
            "Using {} composer (files metadata {})",
            self.kind,
            if self.track_metadata { "tracked" } else { "disabled" }
        );

        Ok(ComposerSetup {
            composer,
            files,
            tar_file_sets,
            options: self.options,
            copy_base,
        })
    }
}
