//! Composer that reuses whole archives of a previous backup.
//!
//! Unchanged files are not read at all; they carry a reference to the base
//! archive holding them. After the walk the bundle copies every base archive
//! whose files are all unchanged and repacks the rest.

use super::{
    ComposeFileInfo, ComposerKind, CopyReference, PackDecision, PackMode, Placement,
    TarBallComposer,
};
use crate::bundle::manifest::BaseBackup;
use std::sync::Arc;

pub struct CopyComposer {
    base: Arc<BaseBackup>,
}

impl CopyComposer {
    pub fn new(base: Arc<BaseBackup>) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &BaseBackup {
        &self.base
    }
}

impl TarBallComposer for CopyComposer {
    fn kind(&self) -> ComposerKind {
        ComposerKind::Copy
    }

    fn decide(&self, file: &ComposeFileInfo) -> PackDecision {
        let reusable = self
            .base
            .file(&file.rel_path)
            .filter(|desc| file.matches(desc) && !desc.is_skipped && !desc.is_incremented)
            .and_then(|desc| desc.archive.clone());

        match reusable {
            Some(archive) => PackDecision {
                placement: Placement::NextFree,
                mode: PackMode::Skip,
                copy_from: Some(CopyReference {
                    base_backup: self.base.name.clone(),
                    archive,
                }),
            },
            None => PackDecision::next_free(PackMode::Full),
        }
    }
}
