//! Error types for the bundling engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Walk error at {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Composer configuration error: {0}")]
    ComposerConfig(String),

    #[error("Archive queue initialization error: {0}")]
    QueueInit(String),

    #[error(
        "Failed to flush archives: {} failed ({}), {} confirmed",
        failed.len(),
        failed.join(", "),
        confirmed.len()
    )]
    Flush {
        confirmed: Vec<String>,
        failed: Vec<String>,
    },

    #[error("Unsupported archive entry {path} of type {kind}")]
    UnsupportedEntry { path: String, kind: String },

    #[error("No such backup: {0}")]
    NoSuchBackup(String),

    #[error("Ambiguous backup selection: {0}")]
    AmbiguousSelection(String),

    #[error("Control file was not found during the walk")]
    MissingSentinel,

    #[error("Archive queue has not been finished")]
    NotFinished,

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Increment error: {0}")]
    Increment(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BundleError {
    /// Wrap a traversal failure for `path`
    pub fn walk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BundleError::Walk {
            path: path.into(),
            source,
        }
    }
}

impl From<walkdir::Error> for BundleError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
        BundleError::Walk { path, source }
    }
}

impl From<tokio::task::JoinError> for BundleError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            BundleError::Cancelled
        } else {
            BundleError::Io(std::io::Error::other(format!("worker task panicked: {}", err)))
        }
    }
}

pub type Result<T> = std::result::Result<T, BundleError>;
