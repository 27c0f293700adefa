//! Compares stored task metadata with current HEAD result for safe resume.

mod error;

use crate::fetch_head::HeadResult;

pub use error::{ValidationError, ValidationErrorKind};

/// The subset of a `SegmentedDownload`'s stored metadata needed to validate
/// that it is still safe to resume against the current remote resource.
#[derive(Debug, Clone, Copy)]
pub struct StoredMetadata<'a> {
    pub total_size: Option<u64>,
    pub etag: Option<&'a str>,
    pub last_modified: Option<&'a str>,
}

/// Returns Ok(()) if the task can be safely resumed against the current HEAD result.
///
/// If the task has no stored metadata (never probed), returns Ok(()) so the caller
/// can proceed with initial probe and segment planning. Otherwise compares ETag,
/// Last-Modified, and size; returns Err(ValidationError) if any differ.
pub fn validate_for_resume(
    stored: StoredMetadata<'_>,
    head: &HeadResult,
) -> Result<(), ValidationError> {
    let has_stored =
        stored.total_size.is_some() || stored.etag.is_some() || stored.last_modified.is_some();

    if !has_stored {
        return Ok(());
    }

    let etag_changed = match (stored.etag, head.etag.as_deref()) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    };

    let last_modified_changed = match (stored.last_modified, head.last_modified.as_deref()) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    };

    let size_changed = match (stored.total_size, head.content_length) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    };

    if etag_changed || last_modified_changed || size_changed {
        return Err(ValidationError {
            kind: ValidationErrorKind::RemoteChanged {
                etag_changed,
                last_modified_changed,
                size_changed,
            },
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests;
