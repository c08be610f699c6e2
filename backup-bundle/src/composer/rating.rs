//! Composer that groups files by how often they are updated.
//!
//! Files with similar update counts land in the same archives, so a later
//! delta backup finds whole archives unchanged more often. Files without
//! statistics behave as with the regular composer.

use super::regular::RegularComposer;
use super::{
    ComposeFileInfo, ComposerKind, FilePackOptions, PackDecision, Placement, TarBallComposer,
};
use std::collections::HashMap;

/// Relative path -> number of updates observed since the last backup
pub type RelFileStatistics = HashMap<String, u64>;

pub struct RatingComposer {
    statistics: RelFileStatistics,
    fallback: RegularComposer,
}

impl RatingComposer {
    pub fn new(statistics: RelFileStatistics, options: &FilePackOptions) -> Self {
        Self {
            statistics,
            fallback: RegularComposer::new(options),
        }
    }

    /// Bit length of the update count; 0 for files never updated
    pub fn rating_group(updates: u64) -> u32 {
        u64::BITS - updates.leading_zeros()
    }
}

impl TarBallComposer for RatingComposer {
    fn kind(&self) -> ComposerKind {
        ComposerKind::Rating
    }

    fn decide(&self, file: &ComposeFileInfo) -> PackDecision {
        let mode = self.fallback.pack_mode(file);
        match self.statistics.get(&file.rel_path) {
            Some(&updates) => PackDecision {
                placement: Placement::Grouped(Self::rating_group(updates)),
                mode,
                copy_from: None,
            },
            None => PackDecision::next_free(mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::PackMode;
    use chrono::Utc;
    use std::path::PathBuf;

    fn info(rel_path: &str) -> ComposeFileInfo {
        ComposeFileInfo {
            path: PathBuf::from(rel_path),
            rel_path: rel_path.to_string(),
            size: 10,
            mtime: Utc::now(),
        }
    }

    #[test]
    fn test_rating_groups() {
        assert_eq!(RatingComposer::rating_group(0), 0);
        assert_eq!(RatingComposer::rating_group(1), 1);
        assert_eq!(RatingComposer::rating_group(3), 2);
        assert_eq!(RatingComposer::rating_group(4), 3);
        assert_eq!(RatingComposer::rating_group(1000), 10);
    }

    #[test]
    fn test_files_with_similar_rates_share_group() {
        let mut stats = RelFileStatistics::new();
        stats.insert("base/1".to_string(), 5);
        stats.insert("base/2".to_string(), 7);
        stats.insert("base/3".to_string(), 900);
        let composer = RatingComposer::new(stats, &FilePackOptions::default());

        let first = composer.decide(&info("base/1"));
        let second = composer.decide(&info("base/2"));
        let hot = composer.decide(&info("base/3"));
        assert_eq!(first.placement, second.placement);
        assert_ne!(first.placement, hot.placement);
        assert_eq!(first.mode, PackMode::Full);
    }

    #[test]
    fn test_missing_statistics_fall_back_to_regular() {
        let composer = RatingComposer::new(RelFileStatistics::new(), &FilePackOptions::default());
        let decision = composer.decide(&info("base/1"));
        assert_eq!(decision, PackDecision::next_free(PackMode::Full));
    }
}
