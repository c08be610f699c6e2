//! Filesystem side of the engine: classification, walking, metadata.

pub mod classify;
pub mod metadata;
pub mod walker;

pub use classify::{classify, Disposition};
pub use walker::{DataDirWalker, WalkedEntry};
