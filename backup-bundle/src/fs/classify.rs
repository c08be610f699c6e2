//! Path classification for walked data directory entries.
//!
//! Decides, from a path relative to the data directory and the entry's file
//! type alone, how the bundle handles it. No state, no I/O.

use std::fs::FileType;
use std::path::{Component, Path};

/// File name of the control file marking the backup's consistency point
pub const SENTINEL_NAME: &str = "pg_control";

/// Relative path of the control file inside the data directory
pub const SENTINEL_PATH: &str = "global/pg_control";

/// Label files written at backup start; packed with the control file
pub const LABEL_FILES: [&str; 2] = ["backup_label", "tablespace_map"];

/// Names that are never backed up. Directories with these names are still
/// recreated (empty) on restore.
pub const EXCLUDED_NAMES: [&str; 17] = [
    "log",
    "pg_log",
    "pg_xlog",
    "pg_wal",
    "pgsql_tmp",
    "postgresql.auto.conf.tmp",
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_stat_tmp",
    "pg_snapshots",
    "pg_subtrans",
    "standby.signal",
];

/// How a walked entry is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The walk root itself
    Root,
    Directory,
    /// Directory kept as an empty placeholder; its contents are not walked
    ExcludedDirectory,
    ExcludedFile,
    Sentinel,
    Label,
    Regular,
    Symlink,
    /// Named pipe, recreated by type on restore
    Special,
    /// Sockets and devices
    Unsupported,
}

/// Whether a single file name belongs to the exclusion set
pub fn is_excluded_name(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
}

/// Classify an entry by its path relative to the data directory
pub fn classify(rel_path: &Path, file_type: FileType) -> Disposition {
    let name = match rel_path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return Disposition::Root,
    };

    if file_type.is_dir() {
        return if is_excluded_name(name) {
            Disposition::ExcludedDirectory
        } else {
            Disposition::Directory
        };
    }

    if is_excluded_name(name) {
        return Disposition::ExcludedFile;
    }

    if file_type.is_symlink() {
        return Disposition::Symlink;
    }

    if file_type.is_file() {
        if rel_path == Path::new(SENTINEL_PATH) {
            return Disposition::Sentinel;
        }
        if rel_path.parent() == Some(Path::new("")) && LABEL_FILES.contains(&name) {
            return Disposition::Label;
        }
        return Disposition::Regular;
    }

    if is_fifo(&file_type) {
        Disposition::Special
    } else {
        Disposition::Unsupported
    }
}

/// True when any ancestor directory of `rel_path` is excluded
pub fn is_inside_excluded(rel_path: &Path) -> bool {
    let Some(parent) = rel_path.parent() else {
        return false;
    };
    parent.components().any(|c| match c {
        Component::Normal(name) => name.to_str().map(is_excluded_name).unwrap_or(false),
        _ => false,
    })
}

/// Normalize an archive or manifest key: no leading `/` or `./`, no trailing `/`
pub fn normalize_key(key: &str) -> String {
    let trimmed = key.trim_start_matches("./").trim_start_matches('/');
    trimmed.trim_end_matches('/').to_string()
}

#[cfg(unix)]
fn is_fifo(file_type: &FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_file_type: &FileType) -> bool {
    false
}
