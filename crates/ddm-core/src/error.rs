//! Crate-wide terminal error taxonomy (§7 disposition layer).
//!
//! `retry::SegmentError`/`ErrorKind` classify a single segment attempt for
//! the *retry* decision; `EngineError` is the disposition a task settles on
//! once retries are exhausted or a non-transient condition is hit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient transport error after {attempts} attempts: {source}")]
    FatalTransport {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("authentication expired (401/403); call update_url with a fresh signed URL")]
    AuthExpired,

    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("task canceled")]
    Canceled,
}
