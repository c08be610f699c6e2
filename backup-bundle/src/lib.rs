//! Base backup bundling engine.
//!
//! Walks a database data directory once, packs it into size-bounded tar
//! partitions written by a pool of concurrent workers, tracks per-file
//! metadata for later delta backups, and extracts partitions back to disk.

pub mod backup;
pub mod bundle;
pub mod composer;
pub mod config;
pub mod daemon;
pub mod extract;
pub mod fs;
pub mod queue;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use bundle::{Bundle, BundleConfig};
pub use config::Config;
pub use utils::errors::BundleError;
pub type Result<T> = std::result::Result<T, BundleError>;
