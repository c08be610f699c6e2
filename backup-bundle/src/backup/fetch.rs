//! Restoring a stored backup into a directory.
//!
//! Delta backups are restored base first: each base contributes only the
//! files its child skipped or stored as increments, then the child's own
//! archives are extracted over them.

use super::selector::BackupSelector;
use crate::bundle::manifest::BackupManifest;
use crate::composer::IncrementCodec;
use crate::extract::{extract_all, ExtractReport, FileReaderMaker, FileTarInterpreter, ReaderMaker};
use crate::queue::SealedArchive;
use crate::storage::{partition_key, Storage};
use crate::utils::Result;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct FetchOptions {
    pub strict: bool,
    pub concurrency: usize,
    pub codec: Option<Arc<dyn IncrementCodec>>,
}

/// One backup of the delta chain and the files it has to provide
struct ChainLink {
    manifest: BackupManifest,
    files_to_unwrap: Option<BTreeSet<String>>,
    /// Only contributes files to a newer backup
    is_base: bool,
}

impl ChainLink {
    /// Archives worth downloading. The selected backup needs all of them
    /// for its directory and link entries; a base only needs the archives
    /// holding requested files, unless its archive membership is unknown.
    fn archives(&self) -> Vec<&SealedArchive> {
        let all = self.manifest.archives.iter();
        let (true, Some(wanted), Some(sets)) = (
            self.is_base,
            self.files_to_unwrap.as_ref(),
            self.manifest.tar_file_sets.as_ref(),
        ) else {
            return all.collect();
        };
        all.filter(|archive| {
            sets.get(&archive.name)
                .is_some_and(|files| files.iter().any(|f| wanted.contains(f)))
        })
        .collect()
    }
}

async fn resolve_chain(
    storage: &dyn Storage,
    selector: &BackupSelector,
) -> Result<Vec<ChainLink>> {
    let top = selector.select(storage).await?;
    let mut requested = top.files_from_base();
    let mut chain = vec![ChainLink {
        files_to_unwrap: top.files_to_unwrap(),
        manifest: top,
        is_base: false,
    }];

    while let Some(base_name) = chain.last().and_then(|l| l.manifest.delta_base.clone()) {
        let base = BackupSelector::ByName(base_name).select(storage).await?;
        let next: BTreeSet<String> = base
            .files
            .iter()
            .flatten()
            .filter(|(path, desc)| {
                requested.contains(path.as_str()) && (desc.is_skipped || desc.is_incremented)
            })
            .map(|(path, _)| path.clone())
            .collect();

        chain.push(ChainLink {
            files_to_unwrap: Some(std::mem::replace(&mut requested, next)),
            manifest: base,
            is_base: true,
        });
    }

    Ok(chain)
}

pub async fn fetch_backup(
    storage: Arc<dyn Storage>,
    selector: &BackupSelector,
    dest: &Path,
    options: &FetchOptions,
) -> Result<ExtractReport> {
    tokio::fs::create_dir_all(dest).await?;
    let chain = resolve_chain(storage.as_ref(), selector).await?;
    let mut report = ExtractReport::default();

    for link in chain.into_iter().rev() {
        let archives = link.archives();
        let manifest = &link.manifest;
        info!(
            "Restoring {} ({} of {} archives) into {}",
            manifest.name,
            archives.len(),
            manifest.archives.len(),
            dest.display()
        );

        let spool = tempfile::TempDir::new()?;
        let mut makers: Vec<Box<dyn ReaderMaker>> = Vec::new();
        for archive in archives {
            let local = spool.path().join(&archive.name);
            storage
                .download_to(&partition_key(&manifest.name, &archive.name), &local)
                .await?;
            makers.push(Box::new(FileReaderMaker::new(archive.name.clone(), local)));
        }

        let mut interpreter = FileTarInterpreter::new(dest)
            .with_files(manifest.files.clone().unwrap_or_default())
            .strict(options.strict);
        if let Some(files) = link.files_to_unwrap.clone() {
            interpreter = interpreter.with_files_to_unwrap(files);
        }
        if let Some(codec) = &options.codec {
            interpreter = interpreter.with_codec(Arc::clone(codec));
        }

        let part = extract_all(Arc::new(interpreter), makers, options.concurrency).await?;
        report.merge(part);
    }

    Ok(report)
}
