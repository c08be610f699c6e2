//! Default composer: every file goes to whichever archive is free.

use super::{
    ComposeFileInfo, ComposerKind, FilePackOptions, PackDecision, PackMode, TarBallComposer,
};
use crate::bundle::manifest::BaseBackup;
use std::sync::Arc;

pub struct RegularComposer {
    delta_base: Option<Arc<BaseBackup>>,
    incremental: bool,
}

impl RegularComposer {
    pub fn new(options: &FilePackOptions) -> Self {
        Self {
            delta_base: options.delta_base.clone(),
            incremental: options.increment_codec.is_some(),
        }
    }

    /// Full unless the delta base already has the file
    pub fn pack_mode(&self, file: &ComposeFileInfo) -> PackMode {
        let base = self
            .delta_base
            .as_ref()
            .and_then(|base| base.file(&file.rel_path));

        match base {
            Some(desc) if file.matches(desc) => PackMode::Skip,
            Some(_) if self.incremental => PackMode::Incremental,
            _ => PackMode::Full,
        }
    }
}

impl TarBallComposer for RegularComposer {
    fn kind(&self) -> ComposerKind {
        ComposerKind::Regular
    }

    fn decide(&self, file: &ComposeFileInfo) -> PackDecision {
        PackDecision::next_free(self.pack_mode(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tracking::FileDescription;
    use crate::composer::{IncrementCodec, Placement};
    use chrono::{DateTime, Utc};
    use std::io;
    use std::path::{Path, PathBuf};

    struct NullCodec;

    impl IncrementCodec for NullCodec {
        fn encode(&self, _path: &Path, _base: &FileDescription) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn apply(&self, _target: &Path, _payload: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    fn mtime() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn info(rel_path: &str, size: u64) -> ComposeFileInfo {
        ComposeFileInfo {
            path: PathBuf::from("/data").join(rel_path),
            rel_path: rel_path.to_string(),
            size,
            mtime: mtime(),
        }
    }

    fn base() -> BaseBackup {
        let mut base = BaseBackup::new("base_1");
        base.files.insert(
            "base/1".to_string(),
            FileDescription {
                mtime: mtime(),
                size: 100,
                is_incremented: false,
                is_skipped: false,
                archive: Some("part_001.tar.zst".to_string()),
            },
        );
        base
    }

    #[test]
    fn test_without_base_everything_is_full() {
        let composer = RegularComposer::new(&FilePackOptions::default());
        let decision = composer.decide(&info("base/1", 100));
        assert_eq!(decision.mode, PackMode::Full);
        assert_eq!(decision.placement, Placement::NextFree);
    }

    #[test]
    fn test_unchanged_file_is_skipped() {
        let options = FilePackOptions::default().with_delta_base(base());
        let composer = RegularComposer::new(&options);
        assert_eq!(composer.pack_mode(&info("base/1", 100)), PackMode::Skip);
        assert_eq!(composer.pack_mode(&info("base/1", 101)), PackMode::Full);
        assert_eq!(composer.pack_mode(&info("base/2", 100)), PackMode::Full);
    }

    #[test]
    fn test_changed_file_is_incremental_with_codec() {
        let options = FilePackOptions::default()
            .with_delta_base(base())
            .with_increment_codec(Arc::new(NullCodec));
        let composer = RegularComposer::new(&options);
        assert_eq!(composer.pack_mode(&info("base/1", 200)), PackMode::Incremental);
        // new files have nothing to diff against
        assert_eq!(composer.pack_mode(&info("base/9", 200)), PackMode::Full);
    }
}
