//! Bounded pool of concurrent archive writers.
//!
//! Each slot owns one open [`TarBall`]. Checking a slot out is the walk's only
//! backpressure point: when every archive is busy, `acquire` waits for a
//! worker to hand one back. Archives are rotated between whole files once
//! they reach the size threshold; sealed archives are uploaded in the
//! background and joined by `drain_and_seal_all`. At most `capacity` sealed
//! archives are uploading at once: a writer that rotates while every upload
//! slot is taken waits, still holding its archive, so upload lag reaches the
//! walk through `acquire`.

pub mod compression;
pub mod tarball;

use crate::storage::Storage;
use crate::utils::{BundleError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use compression::Compression;
pub use tarball::{SpooledArchive, StorageTarBallMaker, TarBall, TarBallMaker};

/// Default archive rotation threshold (uncompressed bytes)
pub const DEFAULT_TAR_SIZE_THRESHOLD: u64 = 1 << 30;

/// Default number of concurrent archive writers
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 16;

/// An archive that reached storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedArchive {
    pub name: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub entries: usize,
    /// Copied from a previous backup instead of written
    #[serde(default)]
    pub copied: bool,
}

/// A checked-out archive; exclusively owned until released
pub struct TarBallSlot {
    tarball: TarBall,
    _permit: OwnedSemaphorePermit,
}

impl TarBallSlot {
    pub fn tarball(&mut self) -> &mut TarBall {
        &mut self.tarball
    }

    pub fn name(&self) -> &str {
        self.tarball.name()
    }
}

type UploadResult = std::result::Result<SealedArchive, (String, BundleError)>;

pub struct TarBallQueue {
    maker: Arc<dyn TarBallMaker>,
    storage: Arc<dyn Storage>,
    threshold: u64,
    capacity: usize,
    permits: Arc<Semaphore>,
    upload_permits: Arc<Semaphore>,
    idle: Mutex<Vec<TarBall>>,
    uploads: Mutex<JoinSet<UploadResult>>,
    runtime: Handle,
}

impl TarBallQueue {
    /// Create the pool; must run inside a tokio runtime
    pub fn start(
        maker: Arc<dyn TarBallMaker>,
        storage: Arc<dyn Storage>,
        threshold: u64,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(BundleError::QueueInit(
                "archive writer concurrency must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current()
            .map_err(|e| BundleError::QueueInit(format!("no async runtime: {}", e)))?;
        let first = maker
            .make()
            .map_err(|e| BundleError::QueueInit(format!("failed to open first archive: {}", e)))?;

        info!(
            "Archive queue started: {} writers, rotation threshold {} bytes",
            capacity, threshold
        );

        Ok(Self {
            maker,
            storage,
            threshold,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            upload_permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(vec![first]),
            uploads: Mutex::new(JoinSet::new()),
            runtime,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn maker(&self) -> &Arc<dyn TarBallMaker> {
        &self.maker
    }

    /// Check out an archive, waiting while all writers are busy
    pub async fn acquire(&self) -> Result<TarBallSlot> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BundleError::Cancelled)?;

        let idle = self.lock_idle().pop();
        let tarball = match idle {
            Some(tarball) => tarball,
            None => self.maker.make()?,
        };

        Ok(TarBallSlot {
            tarball,
            _permit: permit,
        })
    }

    /// Seal the slot's archive and open a fresh one once the threshold is
    /// reached. Called between files only, so a file never spans archives.
    /// Waits for a free upload slot first.
    pub async fn rotate_if_needed(&self, slot: &mut TarBallSlot) -> Result<()> {
        if slot.tarball.size() < self.threshold {
            return Ok(());
        }
        let upload = self.acquire_upload().await?;
        let fresh = self.maker.make()?;
        let full = std::mem::replace(&mut slot.tarball, fresh);
        debug!(
            "Rotating archive {} at {} bytes",
            full.name(),
            full.size()
        );
        self.seal_and_upload(full, upload);
        Ok(())
    }

    /// Return a slot's archive to the pool
    pub fn release(&self, slot: TarBallSlot) {
        let TarBallSlot {
            tarball,
            _permit: permit,
        } = slot;
        self.lock_idle().push(tarball);
        drop(permit);
    }

    /// Schedule a storage-side copy of an archive from another backup
    pub fn copy_archive(&self, from_key: String, entries: usize) -> String {
        let name = self.maker.next_name();
        let to_key = self.maker.storage_key(&name);
        let storage = Arc::clone(&self.storage);
        let archive_name = name.clone();

        self.lock_uploads().spawn_on(
            async move {
                match storage.copy_entry(&from_key, &to_key).await {
                    Ok(()) => {
                        info!("Copied {} to {}", from_key, to_key);
                        Ok(SealedArchive {
                            name: archive_name,
                            compressed_size: 0,
                            uncompressed_size: 0,
                            entries,
                            copied: true,
                        })
                    }
                    Err(e) => Err((archive_name, e)),
                }
            },
            &self.runtime,
        );

        name
    }

    /// Wait for every writer, close the pool, seal all open archives and
    /// join every pending upload
    pub async fn drain_and_seal_all(&self) -> Result<Vec<SealedArchive>> {
        let all = Arc::clone(&self.permits)
            .acquire_many_owned(self.capacity as u32)
            .await
            .map_err(|_| BundleError::Cancelled)?;
        self.permits.close();
        drop(all);

        let open = std::mem::take(&mut *self.lock_idle());
        for tarball in open {
            if tarball.is_empty() {
                continue;
            }
            let upload = self.acquire_upload().await?;
            self.seal_and_upload(tarball, upload);
        }

        let mut uploads = std::mem::take(&mut *self.lock_uploads());
        let mut confirmed = Vec::new();
        let mut failed = Vec::new();

        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok(Ok(archive)) => confirmed.push(archive),
                Ok(Err((name, e))) => {
                    warn!("Archive {} failed: {}", name, e);
                    failed.push(name);
                }
                Err(e) => {
                    warn!("Archive upload task failed: {}", e);
                    failed.push("<unknown>".to_string());
                }
            }
        }

        confirmed.sort_by(|a, b| a.name.cmp(&b.name));

        if !failed.is_empty() {
            failed.sort();
            return Err(BundleError::Flush {
                confirmed: confirmed.into_iter().map(|a| a.name).collect(),
                failed,
            });
        }

        info!("All {} archives sealed and stored", confirmed.len());
        Ok(confirmed)
    }

    /// Seal and upload an archive outside the pool and wait for it
    pub async fn upload_now(&self, tarball: TarBall) -> Result<SealedArchive> {
        let storage = Arc::clone(&self.storage);
        seal_and_store(storage, tarball)
            .await
            .map_err(|(_, e)| e)
    }

    async fn acquire_upload(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.upload_permits)
            .acquire_owned()
            .await
            .map_err(|_| BundleError::Cancelled)
    }

    fn seal_and_upload(&self, tarball: TarBall, upload: OwnedSemaphorePermit) {
        let storage = Arc::clone(&self.storage);
        self.lock_uploads().spawn_on(
            async move {
                let result = seal_and_store(storage, tarball).await;
                drop(upload);
                result
            },
            &self.runtime,
        );
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<TarBall>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_uploads(&self) -> std::sync::MutexGuard<'_, JoinSet<UploadResult>> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn seal_and_store(storage: Arc<dyn Storage>, tarball: TarBall) -> UploadResult {
    let name = tarball.name().to_string();

    let sealed = match tokio::task::spawn_blocking(move || tarball.seal()).await {
        Ok(Ok(sealed)) => sealed,
        Ok(Err(e)) => return Err((name, BundleError::Io(e))),
        Err(e) => return Err((name, BundleError::from(e))),
    };

    let archive = SealedArchive {
        name: sealed.name.clone(),
        compressed_size: sealed.compressed_size,
        uncompressed_size: sealed.uncompressed_size,
        entries: sealed.entries,
        copied: false,
    };
    let key = sealed.key.clone();
    let size = sealed.compressed_size;

    match storage.upload(&key, sealed.into_upload_reader(), size).await {
        Ok(()) => {
            info!(
                "Sealed {}: {} entries, {} bytes ({} compressed)",
                archive.name, archive.entries, archive.uncompressed_size, archive.compressed_size
            );
            Ok(archive)
        }
        Err(e) => Err((name, e)),
    }
}
