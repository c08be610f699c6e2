//! Bundle: drives one backup's walk over the data directory.
//!
//! The walk runs on a single task. Each entry is classified and either
//! handled inline (directories, the control file, labels, special files) or
//! dispatched to a packing worker holding an archive slot. Acquiring that
//! slot is the only place the walk waits on the workers.

pub mod manifest;
pub mod sentinel;
pub mod tracking;

use crate::composer::{
    ComposeFileInfo, ComposerMaker, FilePacker, PackMode, Placement, TarBallComposer,
};
use crate::fs::classify::{self, Disposition, SENTINEL_NAME};
use crate::fs::metadata::modified_time;
use crate::fs::DataDirWalker;
use crate::queue::{SealedArchive, TarBall, TarBallMaker, TarBallQueue, TarBallSlot};
use crate::storage::{partition_key, Storage};
use crate::utils::{BundleError, Result};
use manifest::BaseBackup;
use sentinel::{CapturedFile, Sentinel};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracking::FileDescription;

pub use sentinel::SentinelInfo;

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub root: PathBuf,
    pub tar_size_threshold: u64,
    pub concurrency: usize,
}

/// What the walk does after an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Do not descend into the directory just handled
    SkipDir,
}

/// A file waiting for a worker
#[derive(Debug, Clone)]
struct PendingFile {
    info: ComposeFileInfo,
    metadata: Metadata,
    mode: PackMode,
}

/// Composer plus what it packs with
struct ComposerState {
    composer: Arc<dyn TarBallComposer>,
    packer: FilePacker,
    copy_base: Option<Arc<BaseBackup>>,
}

pub struct Bundle {
    config: BundleConfig,
    cancel: CancellationToken,
    queue: Option<Arc<TarBallQueue>>,
    composer: Option<ComposerState>,
    sentinel: Option<Sentinel>,
    labels: Vec<CapturedFile>,
    groups: BTreeMap<u32, Vec<PendingFile>>,
    copy_plan: BTreeMap<String, Vec<ComposeFileInfo>>,
    in_flight: JoinSet<Result<()>>,
    archives: Option<Vec<SealedArchive>>,
}

impl Bundle {
    pub fn new(config: BundleConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            queue: None,
            composer: None,
            sentinel: None,
            labels: Vec::new(),
            groups: BTreeMap::new(),
            copy_plan: BTreeMap::new(),
            in_flight: JoinSet::new(),
            archives: None,
        }
    }

    /// Stop the walk when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn start_queue(
        &mut self,
        maker: Arc<dyn TarBallMaker>,
        storage: Arc<dyn Storage>,
    ) -> Result<()> {
        let queue = TarBallQueue::start(
            maker,
            storage,
            self.config.tar_size_threshold,
            self.config.concurrency,
        )?;
        self.queue = Some(Arc::new(queue));
        Ok(())
    }

    pub fn setup_composer(&mut self, maker: ComposerMaker) -> Result<()> {
        let setup = maker.make()?;
        self.composer = Some(ComposerState {
            composer: setup.composer,
            packer: FilePacker::new(setup.files, setup.tar_file_sets, setup.options),
            copy_base: setup.copy_base,
        });
        Ok(())
    }

    /// Walk the whole data directory once
    pub async fn walk(&mut self) -> Result<()> {
        self.queue()?;
        self.state()?;

        let root = self.config.root.clone();
        info!("Walking {}", root.display());

        let mut walker = DataDirWalker::new(&root);
        if let Err(e) = self.drive(&mut walker).await {
            error!("Walk of {} failed: {}", root.display(), e);
            self.abort().await;
            return Err(e);
        }

        info!(
            "Walk of {} complete, {} files still packing",
            root.display(),
            self.in_flight.len()
        );
        Ok(())
    }

    async fn drive(&mut self, walker: &mut DataDirWalker) -> Result<()> {
        while let Some(entry) = walker.next() {
            if self.cancel.is_cancelled() {
                return Err(BundleError::Cancelled);
            }
            let entry = entry?;
            if self.handle(&entry.path, &entry.metadata).await? == WalkControl::SkipDir {
                walker.skip_current_dir();
            }
            self.reap_finished()?;
        }
        Ok(())
    }

    /// Handle one walked entry; `metadata` must not follow symlinks
    pub async fn handle(&mut self, path: &Path, metadata: &Metadata) -> Result<WalkControl> {
        let rel = path.strip_prefix(&self.config.root).unwrap_or(path);
        let rel_path = classify::normalize_key(&rel.to_string_lossy());
        let disposition = classify::classify(rel, metadata.file_type());

        if classify::is_inside_excluded(rel) {
            return Ok(if metadata.is_dir() {
                WalkControl::SkipDir
            } else {
                WalkControl::Continue
            });
        }

        match disposition {
            Disposition::Root => Ok(WalkControl::Continue),
            Disposition::ExcludedFile => {
                debug!("Excluding {}", rel_path);
                Ok(WalkControl::Continue)
            }
            Disposition::Directory => {
                self.write_header(|tarball| tarball.append_directory(&rel_path, metadata))
                    .await?;
                Ok(WalkControl::Continue)
            }
            Disposition::ExcludedDirectory => {
                debug!("Keeping {} as an empty directory", rel_path);
                self.write_header(|tarball| tarball.append_directory(&rel_path, metadata))
                    .await?;
                Ok(WalkControl::SkipDir)
            }
            Disposition::Sentinel => {
                self.capture_sentinel(path, &rel_path, metadata)?;
                Ok(WalkControl::Continue)
            }
            Disposition::Label => {
                self.labels.push(CapturedFile::read(path, &rel_path, metadata)?);
                Ok(WalkControl::Continue)
            }
            Disposition::Regular => {
                self.dispatch_file(path, rel_path, metadata).await?;
                Ok(WalkControl::Continue)
            }
            Disposition::Symlink => {
                let target = std::fs::read_link(path).map_err(|e| BundleError::walk(path, e))?;
                self.write_header(|tarball| tarball.append_symlink(&rel_path, metadata, &target))
                    .await?;
                Ok(WalkControl::Continue)
            }
            Disposition::Special => {
                self.write_header(|tarball| tarball.append_fifo(&rel_path, metadata))
                    .await?;
                Ok(WalkControl::Continue)
            }
            Disposition::Unsupported => {
                warn!("Skipping {}: unsupported file type", rel_path);
                Ok(WalkControl::Continue)
            }
        }
    }

    /// No await point: capture never waits on in-flight packing
    fn capture_sentinel(&mut self, path: &Path, rel_path: &str, metadata: &Metadata) -> Result<()> {
        let sentinel = Sentinel::capture(path, rel_path, metadata)?;
        info!(
            "Captured control file {} ({} bytes)",
            sentinel.info.path, sentinel.info.size
        );
        self.sentinel = Some(sentinel);
        Ok(())
    }

    async fn dispatch_file(&mut self, path: &Path, rel_path: String, metadata: &Metadata) -> Result<()> {
        let info = ComposeFileInfo {
            path: path.to_path_buf(),
            rel_path,
            size: metadata.len(),
            mtime: modified_time(metadata),
        };
        let decision = self.state()?.composer.decide(&info);

        match (decision.mode, decision.copy_from) {
            (PackMode::Skip, Some(reference)) => {
                self.copy_plan
                    .entry(reference.archive)
                    .or_default()
                    .push(info);
            }
            (PackMode::Skip, None) => self.state()?.packer.record_skipped(&info),
            (mode, None) => {
                let pending = PendingFile {
                    info,
                    metadata: metadata.clone(),
                    mode,
                };
                match decision.placement {
                    Placement::Grouped(group) => {
                        self.groups.entry(group).or_default().push(pending)
                    }
                    Placement::NextFree => self.spawn_packing(vec![pending]).await?,
                }
            }
            (mode, Some(reference)) => {
                warn!(
                    "Ignoring copy reference to {} for {} packed as {:?}",
                    reference.archive, info.rel_path, mode
                );
                self.spawn_packing(vec![PendingFile {
                    info,
                    metadata: metadata.clone(),
                    mode,
                }])
                .await?;
            }
        }
        Ok(())
    }

    /// Check out an archive and pack `files` into it
    async fn spawn_packing(&mut self, files: Vec<PendingFile>) -> Result<()> {
        let queue = Arc::clone(self.queue()?);
        let packer = self.state()?.packer.clone();
        let slot = queue.acquire().await?;

        self.in_flight.spawn(pack_files(queue, packer, slot, files));
        Ok(())
    }

    /// Header-only entries are written inline into a free archive
    async fn write_header<F>(&self, append: F) -> Result<()>
    where
        F: FnOnce(&mut TarBall) -> std::io::Result<()>,
    {
        let queue = self.queue()?;
        let mut slot = queue.acquire().await?;
        let result = match append(slot.tarball()) {
            Ok(()) => queue.rotate_if_needed(&mut slot).await,
            Err(e) => Err(BundleError::from(e)),
        };
        queue.release(slot);
        result
    }

    /// Surface worker failures while the walk is still running
    fn reap_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.in_flight.try_join_next() {
            joined??;
        }
        Ok(())
    }

    async fn join_in_flight(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.in_flight.join_next().await {
            let outcome = joined.map_err(BundleError::from).and_then(|r| r);
            if let Err(e) = outcome {
                warn!("Packing worker failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Wait for dispatched work and seal what was written
    async fn abort(&mut self) {
        if let Err(e) = self.join_in_flight().await {
            debug!("Ignoring worker failure during abort: {}", e);
        }
        if let Some(queue) = &self.queue {
            match queue.drain_and_seal_all().await {
                Ok(archives) => info!("Sealed {} archives after failed walk", archives.len()),
                Err(e) => warn!("Draining the archive queue failed: {}", e),
            }
        }
    }

    /// The control file, available as soon as the walk has returned
    pub fn sentinel(&self) -> Option<&SentinelInfo> {
        self.sentinel.as_ref().map(|s| &s.info)
    }

    /// Pack deferred work, wait for every worker, seal and store all
    /// archives, then store the control archive last
    pub async fn finish_queue(&mut self) -> Result<Vec<SealedArchive>> {
        if let Err(e) = self.flush_deferred().await {
            self.abort().await;
            return Err(e);
        }

        let queue = Arc::clone(self.queue()?);
        let mut archives = queue.drain_and_seal_all().await?;

        if self.sentinel.is_none() {
            return Err(BundleError::MissingSentinel);
        }
        let control = self.pack_control(&queue).await?;
        archives.push(control);

        info!("Backup archives finished: {}", archives.len());
        self.archives = Some(archives.clone());
        Ok(archives)
    }

    async fn flush_deferred(&mut self) -> Result<()> {
        // hottest group first
        let groups = std::mem::take(&mut self.groups);
        for (group, files) in groups.into_iter().rev() {
            debug!("Packing rating group {} ({} files)", group, files.len());
            self.spawn_packing(files).await?;
        }

        self.resolve_copy_plan().await?;
        self.join_in_flight().await
    }

    /// Copy base archives whose files are all unchanged, repack the rest
    async fn resolve_copy_plan(&mut self) -> Result<()> {
        let plan = std::mem::take(&mut self.copy_plan);
        if plan.is_empty() {
            return Ok(());
        }
        let queue = Arc::clone(self.queue()?);
        let state = self.state()?;
        let packer = state.packer.clone();
        let base = state.copy_base.clone().ok_or_else(|| {
            BundleError::ComposerConfig("copy references without a copy base".to_string())
        })?;
        let extension = format!(".{}", queue.maker().extension());

        let mut repack = Vec::new();
        for (archive, files) in plan {
            let whole = {
                let referenced: BTreeSet<&str> =
                    files.iter().map(|f| f.rel_path.as_str()).collect();
                base.tar_file_sets.get(&archive).is_some_and(|set| {
                    set.len() == referenced.len()
                        && set.iter().all(|p| referenced.contains(p.as_str()))
                })
            };

            if whole && archive.ends_with(&extension) {
                let name = queue.copy_archive(partition_key(&base.name, &archive), files.len());
                info!("Reusing {} of {} as {}", archive, base.name, name);
                packer.record_copied(&files, &name);
            } else {
                debug!("Repacking {} files of partially changed {}", files.len(), archive);
                repack.extend(files);
            }
        }

        for info in repack {
            let metadata = std::fs::symlink_metadata(&info.path)
                .map_err(|e| BundleError::walk(&info.path, e))?;
            self.spawn_packing(vec![PendingFile {
                info,
                metadata,
                mode: PackMode::Full,
            }])
            .await?;
        }
        Ok(())
    }

    async fn pack_control(&self, queue: &TarBallQueue) -> Result<SealedArchive> {
        let sentinel = self.sentinel.clone().ok_or(BundleError::MissingSentinel)?;
        let labels = self.labels.clone();
        let packer = self.state()?.packer.clone();
        let maker = Arc::clone(queue.maker());

        let tarball = tokio::task::spawn_blocking(move || -> Result<TarBall> {
            let mut tarball = maker.make_named(SENTINEL_NAME)?;
            for file in labels.iter().chain(std::iter::once(&sentinel.file)) {
                tarball.append_file(&file.rel_path, &file.metadata, file.content.as_slice(), file.size())?;
                let info = ComposeFileInfo {
                    path: PathBuf::from(&file.rel_path),
                    rel_path: file.rel_path.clone(),
                    size: file.size(),
                    mtime: modified_time(&file.metadata),
                };
                packer.record(&info, tarball.name(), false);
            }
            Ok(tarball)
        })
        .await??;

        queue.upload_now(tarball).await
    }

    /// Archive name -> files it holds; only once the queue is finished
    pub fn pack_tarballs(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.finished()?;
        Ok(self.state()?.packer.tar_file_sets().snapshot())
    }

    /// Per-file descriptions; only once the queue is finished
    pub fn files(&self) -> Result<BTreeMap<String, FileDescription>> {
        self.finished()?;
        Ok(self.state()?.packer.files().snapshot())
    }

    pub fn is_tracking(&self) -> bool {
        self.composer
            .as_ref()
            .is_some_and(|s| s.packer.files().is_tracking())
    }

    pub fn archives(&self) -> Option<&[SealedArchive]> {
        self.archives.as_deref()
    }

    fn finished(&self) -> Result<()> {
        if self.archives.is_some() {
            Ok(())
        } else {
            Err(BundleError::NotFinished)
        }
    }

    fn queue(&self) -> Result<&Arc<TarBallQueue>> {
        self.queue
            .as_ref()
            .ok_or_else(|| BundleError::QueueInit("archive queue was not started".to_string()))
    }

    fn state(&self) -> Result<&ComposerState> {
        self.composer
            .as_ref()
            .ok_or_else(|| BundleError::ComposerConfig("no composer was set up".to_string()))
    }
}

/// Each file is read on a blocking thread; rotation happens between files
/// and may wait for an upload slot while the archive is still checked out
async fn pack_files(
    queue: Arc<TarBallQueue>,
    packer: FilePacker,
    mut slot: TarBallSlot,
    files: Vec<PendingFile>,
) -> Result<()> {
    for file in files {
        let packer = packer.clone();
        let (returned, packed) = tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            let packed = packer.pack(&file.info, &file.metadata, file.mode, slot.tarball());
            (slot, packed)
        })
        .await?;
        slot = returned;

        let step = match packed {
            Ok(_) => queue.rotate_if_needed(&mut slot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = step {
            queue.release(slot);
            return Err(e);
        }
    }
    queue.release(slot);
    Ok(())
}
