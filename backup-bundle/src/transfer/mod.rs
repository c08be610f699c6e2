//! Streaming helpers for uploads.

pub mod progress_stream;
