//! Taking a base backup of a data directory.

use super::selector::{parse_user_data, BackupSelector};
use crate::bundle::manifest::{BackupManifest, BaseBackup, MANIFEST_VERSION};
use crate::bundle::{Bundle, BundleConfig};
use crate::composer::{ComposerKind, ComposerMaker, FilePackOptions, RelFileStatistics};
use crate::config::{BackupSettings, BundleSettings};
use crate::queue::StorageTarBallMaker;
use crate::storage::{manifest_key, Storage};
use crate::utils::{BundleError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a push was asked to do, flags and config already folded
#[derive(Debug, Clone, Default)]
pub struct PushArguments {
    pub data_dir: PathBuf,
    pub permanent: bool,
    pub full_backup: bool,
    pub composer: ComposerKind,
    pub without_files_metadata: bool,
    pub delta_from_name: Option<String>,
    pub delta_from_user_data: Option<String>,
    pub user_data: Option<String>,
    pub rating_stats: Option<PathBuf>,
}

/// Validated push: what to back up and against which base
#[derive(Debug, Clone)]
pub struct PushPlan {
    pub args: PushArguments,
    /// Base to skip unchanged files against; `None` for a full backup
    pub delta_selector: Option<BackupSelector>,
    /// Backup whose archives the copy composer reuses
    pub copy_selector: Option<BackupSelector>,
    pub user_data: Option<serde_json::Value>,
}

impl PushArguments {
    /// Start from the `[backup]` config section
    pub fn from_settings(data_dir: impl Into<PathBuf>, settings: &BackupSettings) -> Self {
        Self {
            data_dir: data_dir.into(),
            composer: settings.composer,
            without_files_metadata: settings.without_files_metadata,
            delta_from_name: settings.delta_from_name.clone(),
            delta_from_user_data: settings.delta_from_user_data.clone(),
            user_data: settings.user_data.clone(),
            rating_stats: settings.rating_stats.clone(),
            ..Default::default()
        }
    }

    pub fn validate(mut self) -> Result<PushPlan> {
        self.delta_from_name = non_empty(self.delta_from_name.take());
        self.delta_from_user_data = non_empty(self.delta_from_user_data.take());
        self.user_data = non_empty(self.user_data.take());

        if self.without_files_metadata {
            if self.composer != ComposerKind::Regular {
                return Err(BundleError::InvalidArguments(format!(
                    "--without-files-metadata cannot be used with the {} composer",
                    self.composer
                )));
            }
            if self.delta_from_name.is_some()
                || self.delta_from_user_data.is_some()
                || self.user_data.is_some()
            {
                return Err(BundleError::InvalidArguments(
                    "--without-files-metadata cannot be used with --delta-from-name, \
                     --delta-from-user-data, --add-user-data"
                        .to_string(),
                ));
            }
            info!("Files metadata tracking is disabled");
            self.full_backup = true;
        }

        if self.composer == ComposerKind::Copy {
            self.full_backup = true;
        }

        let selector = match (&self.delta_from_name, &self.delta_from_user_data) {
            (Some(_), Some(_)) => {
                return Err(BundleError::InvalidArguments(
                    "only one delta target should be specified".to_string(),
                ))
            }
            (Some(name), None) => BackupSelector::from_name(name),
            (None, Some(data)) => BackupSelector::from_user_data(data),
            (None, None) => BackupSelector::Latest,
        };

        let user_data = self.user_data.as_deref().map(parse_user_data);
        let delta_selector = (!self.full_backup).then(|| selector.clone());
        let copy_selector = (self.composer == ComposerKind::Copy).then_some(selector);

        Ok(PushPlan {
            args: self,
            delta_selector,
            copy_selector,
            user_data,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `base_20240101T120000123Z`
pub fn backup_name(time: DateTime<Utc>) -> String {
    format!("base_{}", time.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Resolve a base; "latest" quietly degrades to no base
async fn resolve_base(
    selector: &BackupSelector,
    storage: &dyn Storage,
) -> Result<Option<BaseBackup>> {
    let manifest = match selector.select(storage).await {
        Ok(manifest) => manifest,
        Err(BundleError::NoSuchBackup(_)) if *selector == BackupSelector::Latest => {
            info!("No previous backup found");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    match BaseBackup::from_manifest(&manifest) {
        Ok(base) => Ok(Some(base)),
        Err(e) if *selector == BackupSelector::Latest => {
            warn!("Latest backup cannot be used as a base: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn load_statistics(path: Option<&Path>) -> Result<RelFileStatistics> {
    let Some(path) = path else {
        return Ok(RelFileStatistics::new());
    };
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub async fn push_backup(
    plan: PushPlan,
    settings: &BundleSettings,
    storage: Arc<dyn Storage>,
    cancel: CancellationToken,
) -> Result<BackupManifest> {
    let start_time = Utc::now();
    let name = backup_name(start_time);
    let args = plan.args;
    info!("Starting backup {} of {}", name, args.data_dir.display());

    let delta_base = match &plan.delta_selector {
        Some(selector) => resolve_base(selector, storage.as_ref()).await?,
        None => None,
    };
    let delta_base_name = delta_base.as_ref().map(|b| b.name.clone());
    match &delta_base_name {
        Some(base) => info!("Delta backup from {}", base),
        None => info!("Full backup"),
    }

    let mut options = FilePackOptions::default();
    if let Some(base) = delta_base {
        options = options.with_delta_base(base);
    }

    let composer = match args.composer {
        ComposerKind::Regular => ComposerMaker::regular(options),
        ComposerKind::Rating => {
            let statistics = load_statistics(args.rating_stats.as_deref())?;
            ComposerMaker::rating(statistics, options)
        }
        ComposerKind::Copy => {
            let base = match &plan.copy_selector {
                Some(selector) => resolve_base(selector, storage.as_ref()).await?,
                None => None,
            };
            ComposerMaker::copy(base, options)
        }
    };
    let composer = if args.without_files_metadata {
        composer.without_files_metadata()
    } else {
        composer
    };

    let compression = settings.compression()?;
    let maker = StorageTarBallMaker::new(name.clone(), compression)
        .with_spool_dir(settings.spool_dir.clone());

    let mut bundle = Bundle::new(BundleConfig {
        root: args.data_dir.clone(),
        tar_size_threshold: settings.tar_size_threshold,
        concurrency: settings.upload_concurrency,
    })
    .with_cancel(cancel);

    bundle.setup_composer(composer)?;
    bundle.start_queue(Arc::new(maker), Arc::clone(&storage))?;
    bundle.walk().await?;
    let archives = bundle.finish_queue().await?;

    let sentinel = bundle.sentinel().cloned().ok_or(BundleError::MissingSentinel)?;
    let tracking = bundle.is_tracking();
    let files = bundle.files()?;
    let tar_file_sets = bundle.pack_tarballs()?;

    let (total_files, total_bytes) = if tracking {
        let stored = files.values().filter(|d| !d.is_skipped);
        stored.fold((0, 0), |(count, bytes), d| (count + 1, bytes + d.size))
    } else {
        archives
            .iter()
            .fold((0, 0), |(count, bytes), a| (count + a.entries, bytes + a.uncompressed_size))
    };

    let manifest = BackupManifest {
        version: MANIFEST_VERSION,
        name: name.clone(),
        sentinel,
        files: tracking.then_some(files),
        tar_file_sets: tracking.then_some(tar_file_sets),
        archives,
        composer: args.composer,
        delta_base: delta_base_name,
        compression: compression.name().to_string(),
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default(),
        start_time,
        finish_time: Utc::now(),
        is_permanent: args.permanent,
        user_data: plan.user_data,
        total_files,
        total_bytes,
    };

    storage
        .upload_bytes(&manifest_key(&name), serde_json::to_vec_pretty(&manifest)?)
        .await?;

    info!(
        "Backup {} complete: {} archives, {} files, {} bytes",
        name,
        manifest.archives.len(),
        manifest.total_files,
        manifest.total_bytes
    );
    Ok(manifest)
}
