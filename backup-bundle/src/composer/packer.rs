//! Streams one file into an archive and records where it went.
//!
//! Runs on blocking threads; the bundle hands it an exclusively owned
//! archive. Metadata is recorded only after the file's bytes are written.

use super::{ComposeFileInfo, FilePackOptions, PackMode};
use crate::bundle::tracking::{BundleFiles, FileDescription, TarFileSets};
use crate::queue::TarBall;
use crate::utils::{BundleError, Result};
use std::fs::{File, Metadata};
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct FilePacker {
    files: Arc<dyn BundleFiles>,
    tar_file_sets: Arc<dyn TarFileSets>,
    options: FilePackOptions,
}

impl FilePacker {
    pub fn new(
        files: Arc<dyn BundleFiles>,
        tar_file_sets: Arc<dyn TarFileSets>,
        options: FilePackOptions,
    ) -> Self {
        Self {
            files,
            tar_file_sets,
            options,
        }
    }

    /// Pack `file` into `tarball`. Returns false when the file vanished
    /// before it could be read.
    pub fn pack(
        &self,
        file: &ComposeFileInfo,
        metadata: &Metadata,
        mode: PackMode,
        tarball: &mut TarBall,
    ) -> Result<bool> {
        let packed = match mode {
            PackMode::Full => self.pack_full(file, metadata, tarball),
            PackMode::Incremental => self.pack_increment(file, metadata, tarball),
            PackMode::Skip => {
                self.record_skipped(file);
                return Ok(true);
            }
        };

        match packed {
            Ok(()) => {
                self.record(file, tarball.name(), mode == PackMode::Incremental);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} disappeared before it was packed, skipping", file.rel_path);
                Ok(false)
            }
            Err(e) => Err(BundleError::Io(e)),
        }
    }

    fn pack_full(
        &self,
        file: &ComposeFileInfo,
        metadata: &Metadata,
        tarball: &mut TarBall,
    ) -> std::io::Result<()> {
        let source = File::open(&file.path)?;
        tarball.append_file(&file.rel_path, metadata, source, file.size)
    }

    fn pack_increment(
        &self,
        file: &ComposeFileInfo,
        metadata: &Metadata,
        tarball: &mut TarBall,
    ) -> std::io::Result<()> {
        let (Some(codec), Some(base)) = (
            self.options.increment_codec.as_ref(),
            self.options.base_file(&file.rel_path),
        ) else {
            debug!("No increment base for {}, packing full", file.rel_path);
            return self.pack_full(file, metadata, tarball);
        };

        let payload = codec.encode(&file.path, base)?;
        let size = payload.len() as u64;
        tarball.append_file(&file.rel_path, metadata, payload.as_slice(), size)
    }

    pub fn record(&self, file: &ComposeFileInfo, archive: &str, incremented: bool) {
        self.files.add_file(
            &file.rel_path,
            FileDescription {
                mtime: file.mtime,
                size: file.size,
                is_incremented: incremented,
                is_skipped: false,
                archive: Some(archive.to_string()),
            },
        );
        self.tar_file_sets.add_file(archive, &file.rel_path);
    }

    pub fn record_skipped(&self, file: &ComposeFileInfo) {
        self.files.add_file(
            &file.rel_path,
            FileDescription {
                mtime: file.mtime,
                size: file.size,
                is_incremented: false,
                is_skipped: true,
                archive: None,
            },
        );
    }

    /// Files carried over in an archive copied from another backup
    pub fn record_copied(&self, files: &[ComposeFileInfo], archive: &str) {
        let paths: Vec<String> = files.iter().map(|f| f.rel_path.clone()).collect();
        for file in files {
            self.files.add_file(
                &file.rel_path,
                FileDescription {
                    mtime: file.mtime,
                    size: file.size,
                    is_incremented: false,
                    is_skipped: false,
                    archive: Some(archive.to_string()),
                },
            );
        }
        self.tar_file_sets.add_files(archive, &paths);
    }

    pub fn files(&self) -> &Arc<dyn BundleFiles> {
        &self.files
    }

    pub fn tar_file_sets(&self) -> &Arc<dyn TarFileSets> {
        &self.tar_file_sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::manifest::BaseBackup;
    use crate::bundle::tracking::{RegularBundleFiles, RegularTarFileSets};
    use crate::composer::IncrementCodec;
    use crate::fs::metadata::modified_time;
    use crate::queue::{Compression, StorageTarBallMaker, TarBallMaker};
    use std::fs;
    use std::io::{self, Read};
    use std::path::Path;
    use tempfile::TempDir;

    /// Stores only the bytes past the base size
    struct TailCodec;

    impl IncrementCodec for TailCodec {
        fn encode(&self, path: &Path, base: &FileDescription) -> io::Result<Vec<u8>> {
            let data = fs::read(path)?;
            Ok(data[base.size as usize..].to_vec())
        }

        fn apply(&self, target: &Path, payload: &[u8]) -> io::Result<()> {
            let mut data = fs::read(target)?;
            data.extend_from_slice(payload);
            fs::write(target, data)
        }
    }

    fn packer(options: FilePackOptions) -> FilePacker {
        FilePacker::new(
            Arc::new(RegularBundleFiles::new()),
            Arc::new(RegularTarFileSets::new()),
            options,
        )
    }

    fn info_for(path: &Path, rel_path: &str) -> io::Result<(ComposeFileInfo, Metadata)> {
        let metadata = fs::metadata(path)?;
        let info = ComposeFileInfo {
            path: path.to_path_buf(),
            rel_path: rel_path.to_string(),
            size: metadata.len(),
            mtime: modified_time(&metadata),
        };
        Ok((info, metadata))
    }

    #[test]
    fn test_full_pack_records_metadata() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("1");
        fs::write(&path, vec![5u8; 100])?;
        let (info, metadata) = info_for(&path, "base/1")?;

        let packer = packer(FilePackOptions::default());
        let mut tarball = StorageTarBallMaker::new("b", Compression::None).make()?;
        assert!(packer.pack(&info, &metadata, PackMode::Full, &mut tarball)?);

        let files = packer.files().snapshot();
        assert_eq!(files["base/1"].archive.as_deref(), Some("part_001.tar"));
        assert_eq!(files["base/1"].size, 100);
        assert_eq!(packer.tar_file_sets().snapshot()["part_001.tar"], vec!["base/1"]);
        Ok(())
    }

    #[test]
    fn test_vanished_file_is_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("1");
        fs::write(&path, b"x")?;
        let (info, metadata) = info_for(&path, "1")?;
        fs::remove_file(&path)?;

        let packer = packer(FilePackOptions::default());
        let mut tarball = StorageTarBallMaker::new("b", Compression::None).make()?;
        assert!(!packer.pack(&info, &metadata, PackMode::Full, &mut tarball)?);
        assert!(tarball.is_empty());
        assert!(packer.files().snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn test_increment_pack_stores_codec_payload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("1");
        fs::write(&path, b"basetail")?;
        let (info, metadata) = info_for(&path, "base/1")?;

        let mut base = BaseBackup::new("base_0");
        base.files.insert(
            "base/1".to_string(),
            FileDescription {
                mtime: info.mtime,
                size: 4,
                is_incremented: false,
                is_skipped: false,
                archive: Some("part_001.tar".to_string()),
            },
        );
        let options = FilePackOptions::default()
            .with_delta_base(base)
            .with_increment_codec(Arc::new(TailCodec));
        let packer = packer(options);

        let mut tarball = StorageTarBallMaker::new("b", Compression::None).make()?;
        packer.pack(&info, &metadata, PackMode::Incremental, &mut tarball)?;
        assert!(packer.files().snapshot()["base/1"].is_incremented);

        let sealed = tarball.seal()?;
        let mut archive = tar::Archive::new(sealed.file);
        let mut entry = archive.entries()?.next().unwrap()?;
        let mut payload = Vec::new();
        entry.read_to_end(&mut payload)?;
        assert_eq!(payload, b"tail");
        Ok(())
    }
}
