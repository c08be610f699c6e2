//! A single archive partition and the factory that opens new ones.
//!
//! A `TarBall` streams tar entries through the compression filter into an
//! anonymous spool file. Sealing finishes the tar stream and the compressor
//! and returns the spool file ready for upload.

use super::compression::{CompressedWriter, Compression};
use crate::fs::metadata::permission_bits;
use crate::storage::{partition_key, UploadReader};
use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tar::{EntryType, Header, HeaderMode};

/// Counts bytes entering the compressor (the archive's uncompressed size)
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader yielding exactly `size` bytes: a source that shrank after it was
/// stat'ed is padded with zeros, one that grew is cut off.
struct ExactSizeReader<R> {
    inner: R,
    remaining: u64,
    exhausted: bool,
}

impl<R: Read> ExactSizeReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            exhausted: false,
        }
    }
}

impl<R: Read> Read for ExactSizeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);

        let n = if self.exhausted {
            0
        } else {
            self.inner.read(&mut buf[..want])?
        };

        let n = if n == 0 {
            self.exhausted = true;
            buf[..want].fill(0);
            want
        } else {
            n
        };

        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Sealed archive waiting for upload
pub struct SpooledArchive {
    pub name: String,
    pub key: String,
    pub file: File,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub entries: usize,
}

impl SpooledArchive {
    pub fn into_upload_reader(self) -> UploadReader {
        Box::pin(tokio::fs::File::from_std(self.file))
    }
}

/// One open archive partition
pub struct TarBall {
    name: String,
    key: String,
    builder: tar::Builder<CountingWriter<CompressedWriter>>,
    entries: usize,
}

impl TarBall {
    pub fn create(
        name: String,
        key: String,
        compression: Compression,
        spool_dir: Option<&Path>,
    ) -> io::Result<Self> {
        let spool = match spool_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let writer = CountingWriter {
            inner: compression.writer(spool)?,
            written: 0,
        };
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        Ok(Self {
            name,
            key,
            builder,
            entries: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Uncompressed bytes written so far
    pub fn size(&self) -> u64 {
        self.builder.get_ref().written
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Append file content under `rel_path`; exactly `size` bytes are stored
    pub fn append_file<R: Read>(
        &mut self,
        rel_path: &str,
        metadata: &Metadata,
        content: R,
        size: u64,
    ) -> io::Result<()> {
        let mut header = header_for(metadata, EntryType::Regular, size);
        self.builder
            .append_data(&mut header, rel_path, ExactSizeReader::new(content, size))?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_directory(&mut self, rel_path: &str, metadata: &Metadata) -> io::Result<()> {
        let mut header = header_for(metadata, EntryType::Directory, 0);
        self.builder
            .append_data(&mut header, rel_path, io::empty())?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_symlink(
        &mut self,
        rel_path: &str,
        metadata: &Metadata,
        target: &Path,
    ) -> io::Result<()> {
        let mut header = header_for(metadata, EntryType::Symlink, 0);
        self.builder.append_link(&mut header, rel_path, target)?;
        self.entries += 1;
        Ok(())
    }

    /// Header-only entry for a named pipe
    pub fn append_fifo(&mut self, rel_path: &str, metadata: &Metadata) -> io::Result<()> {
        let mut header = header_for(metadata, EntryType::Fifo, 0);
        self.builder
            .append_data(&mut header, rel_path, io::empty())?;
        self.entries += 1;
        Ok(())
    }

    /// Finish the tar stream and the compressor
    pub fn seal(self) -> io::Result<SpooledArchive> {
        let counting = self.builder.into_inner()?;
        let uncompressed_size = counting.written;
        let mut file = counting.inner.finish()?;
        let compressed_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(SpooledArchive {
            name: self.name,
            key: self.key,
            file,
            compressed_size,
            uncompressed_size,
            entries: self.entries,
        })
    }
}

fn header_for(metadata: &Metadata, entry_type: EntryType, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(metadata, HeaderMode::Complete);
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(permission_bits(metadata));
    header
}

/// Factory for archive partitions
pub trait TarBallMaker: Send + Sync {
    /// Open the next numbered partition
    fn make(&self) -> io::Result<TarBall>;

    /// Open a partition with a fixed stem, e.g. `pg_control`
    fn make_named(&self, stem: &str) -> io::Result<TarBall>;

    /// Reserve the next partition name without opening anything
    fn next_name(&self) -> String;

    /// Storage key of a partition of this backup
    fn storage_key(&self, name: &str) -> String;

    /// Archive file extension, e.g. `tar.zst`
    fn extension(&self) -> &'static str;
}

/// Partitions named `part_001.tar.zst`, ... under the backup's
/// `tar_partitions` prefix
pub struct StorageTarBallMaker {
    backup_name: String,
    compression: Compression,
    spool_dir: Option<PathBuf>,
    counter: AtomicUsize,
}

impl StorageTarBallMaker {
    pub fn new(backup_name: impl Into<String>, compression: Compression) -> Self {
        Self {
            backup_name: backup_name.into(),
            compression,
            spool_dir: None,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn with_spool_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spool_dir = dir;
        self
    }

    pub fn backup_name(&self) -> &str {
        &self.backup_name
    }

    fn open(&self, name: String) -> io::Result<TarBall> {
        let key = self.storage_key(&name);
        TarBall::create(name, key, self.compression, self.spool_dir.as_deref())
    }
}

impl TarBallMaker for StorageTarBallMaker {
    fn make(&self) -> io::Result<TarBall> {
        self.open(self.next_name())
    }

    fn make_named(&self, stem: &str) -> io::Result<TarBall> {
        self.open(format!("{}.{}", stem, self.compression.extension()))
    }

    fn next_name(&self) -> String {
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("part_{:03}.{}", number, self.compression.extension())
    }

    fn storage_key(&self, name: &str) -> String {
        partition_key(&self.backup_name, name)
    }

    fn extension(&self) -> &'static str {
        self.compression.extension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn read_entries(archive: SpooledArchive, compression: Compression) -> Vec<(String, Vec<u8>)> {
        let reader = compression.reader(archive.file).unwrap();
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let path = e.path().unwrap().to_string_lossy().to_string();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    #[test]
    fn test_partition_naming() {
        let maker = StorageTarBallMaker::new("base_1", Compression::default());
        assert_eq!(maker.next_name(), "part_001.tar.zst");
        assert_eq!(maker.next_name(), "part_002.tar.zst");

        let ball = maker.make().unwrap();
        assert_eq!(ball.name(), "part_003.tar.zst");
        assert_eq!(
            ball.key(),
            "basebackups_005/base_1/tar_partitions/part_003.tar.zst"
        );

        let control = maker.make_named("pg_control").unwrap();
        assert_eq!(control.name(), "pg_control.tar.zst");
    }

    #[test]
    fn test_append_and_seal() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("1");
        fs::write(&path, vec![3u8; 1000])?;
        let metadata = fs::metadata(&path)?;

        let maker = StorageTarBallMaker::new("base_1", Compression::default());
        let mut ball = maker.make()?;
        assert!(ball.is_empty());

        ball.append_directory("base", &fs::metadata(temp_dir.path())?)?;
        ball.append_file("base/1", &metadata, fs::File::open(&path)?, 1000)?;
        assert_eq!(ball.entries(), 2);
        // two headers plus two padded data blocks
        assert!(ball.size() >= 512 * 2 + 1024);

        let sealed = ball.seal()?;
        assert!(sealed.compressed_size > 0);
        assert!(sealed.uncompressed_size >= sealed.compressed_size);

        let entries = read_entries(sealed, Compression::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0, "base/1");
        assert_eq!(entries[1].1, vec![3u8; 1000]);
        Ok(())
    }

    #[test]
    fn test_shrunk_file_is_padded() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("stat");
        fs::write(&path, b"abc")?;
        let metadata = fs::metadata(&path)?;

        let mut ball = StorageTarBallMaker::new("b", Compression::None).make()?;
        ball.append_file("shrank", &metadata, &b"ab"[..], 3)?;
        ball.append_file("grew", &metadata, &b"abcdef"[..], 3)?;

        let entries = read_entries(ball.seal()?, Compression::None);
        assert_eq!(entries[0].1, b"ab\0");
        assert_eq!(entries[1].1, b"abc");
        Ok(())
    }
}
