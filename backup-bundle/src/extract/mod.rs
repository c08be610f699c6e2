//! Materializes archive entries on disk.
//!
//! Independent archives are extracted concurrently, each on its own blocking
//! thread; entries within one archive are read strictly in order.

use crate::bundle::tracking::FileDescription;
use crate::composer::IncrementCodec;
use crate::fs::classify::{is_inside_excluded, normalize_key};
use crate::fs::metadata::apply_mode;
use crate::queue::Compression;
use crate::utils::{BundleError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::EntryType;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What happened to one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Extracted,
    Skipped,
    Unsupported(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub extracted: usize,
    pub skipped: usize,
    /// Entries left out in lenient mode
    pub unsupported: Vec<String>,
}

impl ExtractReport {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Extracted => self.extracted += 1,
            EntryOutcome::Skipped => self.skipped += 1,
            EntryOutcome::Unsupported(path) => self.unsupported.push(path),
        }
    }

    pub fn merge(&mut self, other: ExtractReport) {
        self.extracted += other.extracted;
        self.skipped += other.skipped;
        self.unsupported.extend(other.unsupported);
    }
}

pub struct FileTarInterpreter {
    dest: PathBuf,
    files: BTreeMap<String, FileDescription>,
    files_to_unwrap: Option<BTreeSet<String>>,
    codec: Option<Arc<dyn IncrementCodec>>,
    strict: bool,
}

impl FileTarInterpreter {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            files: BTreeMap::new(),
            files_to_unwrap: None,
            codec: None,
            strict: false,
        }
    }

    /// Descriptions used to recognize incremented files
    pub fn with_files(mut self, files: BTreeMap<String, FileDescription>) -> Self {
        self.files = files;
        self
    }

    /// Restrict regular files to this set; everything is extracted otherwise
    pub fn with_files_to_unwrap<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.files_to_unwrap = Some(paths.into_iter().map(|p| normalize_key(&p)).collect());
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn IncrementCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Fail on unsupported entries instead of collecting them
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Extract every entry of one archive stream
    pub fn extract_archive<R: Read>(&self, source: R) -> Result<ExtractReport> {
        let mut archive = tar::Archive::new(source);
        let mut report = ExtractReport::default();
        for entry in archive.entries()? {
            let mut entry = entry?;
            report.record(self.interpret(&mut entry)?);
        }
        Ok(report)
    }

    pub fn interpret<R: Read>(&self, entry: &mut tar::Entry<'_, R>) -> Result<EntryOutcome> {
        let raw_path = entry.path()?.to_string_lossy().to_string();
        let rel_path = normalize_key(&raw_path);
        if rel_path.is_empty() {
            return Ok(EntryOutcome::Skipped);
        }
        let rel = Path::new(&rel_path);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(BundleError::UnsupportedEntry {
                path: raw_path,
                kind: "path escaping the destination".to_string(),
            });
        }

        // excluded directories are restored empty
        if is_inside_excluded(rel) {
            debug!("Skipping {} inside an excluded directory", rel_path);
            return Ok(EntryOutcome::Skipped);
        }

        let target = self.dest.join(rel);
        let mode = entry.header().mode().unwrap_or(0o600);
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Regular | EntryType::Continuous => {
                if !self.should_unwrap(&rel_path) {
                    return Ok(EntryOutcome::Skipped);
                }
                self.write_file(entry, &rel_path, &target, mode)?;
            }
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                apply_mode(&target, mode)?;
            }
            EntryType::Symlink => {
                let link = entry.link_name()?.ok_or_else(|| BundleError::UnsupportedEntry {
                    path: rel_path.clone(),
                    kind: "symlink without target".to_string(),
                })?;
                create_parent(&target)?;
                replace_existing(&target)?;
                make_symlink(&link, &target)?;
            }
            EntryType::Link => {
                let link = entry.link_name()?.ok_or_else(|| BundleError::UnsupportedEntry {
                    path: rel_path.clone(),
                    kind: "hard link without target".to_string(),
                })?;
                let original = self.dest.join(normalize_key(&link.to_string_lossy()));
                create_parent(&target)?;
                replace_existing(&target)?;
                fs::hard_link(original, &target)?;
            }
            EntryType::Fifo => {
                create_parent(&target)?;
                replace_existing(&target)?;
                make_fifo(&target, mode)?;
            }
            other => return self.unsupported(rel_path, other),
        }

        Ok(EntryOutcome::Extracted)
    }

    fn should_unwrap(&self, rel_path: &str) -> bool {
        self.files_to_unwrap
            .as_ref()
            .map_or(true, |set| set.contains(rel_path))
    }

    fn write_file<R: Read>(
        &self,
        entry: &mut R,
        rel_path: &str,
        target: &Path,
        mode: u32,
    ) -> Result<()> {
        create_parent(target)?;

        let incremented = self.files.get(rel_path).is_some_and(|d| d.is_incremented);
        if incremented {
            let codec = self.codec.as_ref().ok_or_else(|| {
                BundleError::Increment(format!("{} is incremental but no codec is set", rel_path))
            })?;
            let mut payload = Vec::new();
            entry.read_to_end(&mut payload)?;
            codec.apply(target, &payload)?;
        } else {
            replace_existing(target)?;
            let mut file = File::create(target)?;
            io::copy(entry, &mut file)?;
        }

        apply_mode(target, mode)?;
        Ok(())
    }

    fn unsupported(&self, path: String, entry_type: EntryType) -> Result<EntryOutcome> {
        let kind = format!("{:?}", entry_type);
        if self.strict {
            return Err(BundleError::UnsupportedEntry { path, kind });
        }
        warn!("Skipping unsupported entry {} of type {}", path, kind);
        Ok(EntryOutcome::Unsupported(path))
    }
}

fn create_parent(target: &Path) -> io::Result<()> {
    match target.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Remove a non-directory node about to be replaced
fn replace_existing(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(target),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}

#[cfg(unix)]
fn make_fifo(target: &Path, mode: u32) -> io::Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(target, Mode::from_bits_truncate(mode as _)).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn make_fifo(_target: &Path, _mode: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "named pipes are not supported"))
}

/// Source of one archive's bytes
pub trait ReaderMaker: Send + Sync {
    /// Archive name or key; the extension selects decompression
    fn key(&self) -> &str;

    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// Archive stored in a local file
pub struct FileReaderMaker {
    key: String,
    path: PathBuf,
}

impl FileReaderMaker {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
        }
    }
}

impl ReaderMaker for FileReaderMaker {
    fn key(&self) -> &str {
        &self.key
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::BufReader::new(File::open(&self.path)?)))
    }
}

fn extract_one(interpreter: &FileTarInterpreter, maker: &dyn ReaderMaker) -> Result<ExtractReport> {
    let compression = Compression::from_archive_name(maker.key()).unwrap_or(Compression::None);
    let reader = compression.reader(maker.open()?)?;
    let report = interpreter.extract_archive(reader)?;
    debug!(
        "Extracted {}: {} entries, {} skipped",
        maker.key(),
        report.extracted,
        report.skipped
    );
    Ok(report)
}

/// Extract archives concurrently, at most `concurrency` at a time
pub async fn extract_all(
    interpreter: Arc<FileTarInterpreter>,
    makers: Vec<Box<dyn ReaderMaker>>,
    concurrency: usize,
) -> Result<ExtractReport> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for maker in makers {
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|_| BundleError::Cancelled)?;
        let interpreter = Arc::clone(&interpreter);
        tasks.spawn_blocking(move || {
            let result = extract_one(&interpreter, maker.as_ref());
            drop(permit);
            result
        });
    }

    let mut report = ExtractReport::default();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(BundleError::from).and_then(|r| r) {
            Ok(part) => report.merge(part),
            Err(e) => {
                warn!("Archive extraction failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    info!(
        "Extraction into {} finished: {} entries, {} skipped, {} unsupported",
        interpreter.dest().display(),
        report.extracted,
        report.skipped,
        report.unsupported.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::Header;
    use tempfile::TempDir;

    fn header(entry_type: EntryType, size: u64, mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_mtime(1_700_000_000);
        header
    }

    fn archive(build: impl FnOnce(&mut tar::Builder<Vec<u8>>) -> io::Result<()>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder).unwrap();
        builder.into_inner().unwrap()
    }

    fn file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> io::Result<()> {
        let mut h = header(EntryType::Regular, data.len() as u64, 0o640);
        builder.append_data(&mut h, path, data)
    }

    #[test]
    fn test_regular_files_and_directories() -> Result<()> {
        let dest = TempDir::new()?;
        let data = archive(|b| {
            let mut dir = header(EntryType::Directory, 0, 0o700);
            b.append_data(&mut dir, "base", io::empty())?;
            file(b, "base/1", b"hello")?;
            file(b, "global/pg_control", b"control")
        });

        let report = FileTarInterpreter::new(dest.path()).extract_archive(data.as_slice())?;
        assert_eq!(report.extracted, 3);
        assert_eq!(fs::read(dest.path().join("base/1"))?, b"hello");
        assert_eq!(fs::read(dest.path().join("global/pg_control"))?, b"control");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.path().join("base/1"))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o640);
        }
        Ok(())
    }

    #[test]
    fn test_files_outside_unwrap_set_are_skipped() -> Result<()> {
        let dest = TempDir::new()?;
        let data = archive(|b| {
            file(b, "1", b"a")?;
            file(b, "2", b"b")
        });

        let report = FileTarInterpreter::new(dest.path())
            .with_files_to_unwrap(vec!["/1".to_string()])
            .extract_archive(data.as_slice())?;
        assert_eq!(report.extracted, 1);
        assert_eq!(report.skipped, 1);
        assert!(dest.path().join("1").exists());
        assert!(!dest.path().join("2").exists());
        Ok(())
    }

    #[test]
    fn test_excluded_directory_restored_empty() -> Result<()> {
        let dest = TempDir::new()?;
        let data = archive(|b| {
            let mut dir = header(EntryType::Directory, 0, 0o700);
            b.append_data(&mut dir, "pg_notify", io::empty())?;
            file(b, "pg_notify/0000", b"stale")
        });

        FileTarInterpreter::new(dest.path()).extract_archive(data.as_slice())?;
        assert!(dest.path().join("pg_notify").is_dir());
        assert_eq!(fs::read_dir(dest.path().join("pg_notify"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_unsupported_entries_lenient_and_strict() -> Result<()> {
        let data = archive(|b| {
            let mut dev = header(EntryType::Char, 0, 0o600);
            b.append_data(&mut dev, "dev/null", io::empty())?;
            file(b, "1", b"a")
        });

        let dest = TempDir::new()?;
        let report = FileTarInterpreter::new(dest.path()).extract_archive(data.as_slice())?;
        assert_eq!(report.unsupported, vec!["dev/null".to_string()]);
        assert_eq!(report.extracted, 1);

        let dest = TempDir::new()?;
        let result = FileTarInterpreter::new(dest.path())
            .strict(true)
            .extract_archive(data.as_slice());
        assert!(matches!(result, Err(BundleError::UnsupportedEntry { .. })));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_and_fifo() -> Result<()> {
        use std::os::unix::fs::FileTypeExt;

        let dest = TempDir::new()?;
        let data = archive(|b| {
            let mut link = header(EntryType::Symlink, 0, 0o777);
            b.append_link(&mut link, "pg_tblspc/16384", "/mnt/tablespace")?;
            let mut fifo = header(EntryType::Fifo, 0, 0o600);
            b.append_data(&mut fifo, "pipe", io::empty())
        });

        FileTarInterpreter::new(dest.path()).extract_archive(data.as_slice())?;
        assert_eq!(
            fs::read_link(dest.path().join("pg_tblspc/16384"))?,
            PathBuf::from("/mnt/tablespace")
        );
        assert!(fs::symlink_metadata(dest.path().join("pipe"))?
            .file_type()
            .is_fifo());
        Ok(())
    }

    #[test]
    fn test_incremented_file_requires_codec() -> Result<()> {
        let dest = TempDir::new()?;
        let data = archive(|b| file(b, "base/1", b"delta"));
        let mut files = BTreeMap::new();
        files.insert(
            "base/1".to_string(),
            FileDescription {
                mtime: chrono::Utc::now(),
                size: 5,
                is_incremented: true,
                is_skipped: false,
                archive: Some("part_001.tar".to_string()),
            },
        );

        let result = FileTarInterpreter::new(dest.path())
            .with_files(files)
            .extract_archive(data.as_slice());
        assert!(matches!(result, Err(BundleError::Increment(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_extract_all_runs_every_archive() -> Result<()> {
        let store = TempDir::new()?;
        let dest = TempDir::new()?;
        let mut makers: Vec<Box<dyn ReaderMaker>> = Vec::new();
        for i in 0..4 {
            let name = format!("part_{:03}.tar", i + 1);
            let path = store.path().join(&name);
            let rel = format!("base/{}", i);
            fs::write(&path, archive(|b| file(b, &rel, b"data")))?;
            makers.push(Box::new(FileReaderMaker::new(name, path)));
        }

        let interpreter = Arc::new(FileTarInterpreter::new(dest.path()));
        let report = extract_all(interpreter, makers, 2).await?;
        assert_eq!(report.extracted, 4);
        assert!(dest.path().join("base/3").exists());
        Ok(())
    }
}
