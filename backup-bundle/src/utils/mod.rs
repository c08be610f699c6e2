//! Utility modules for the bundling engine.

pub mod errors;
pub mod logger;

pub use errors::{BundleError, Result};
