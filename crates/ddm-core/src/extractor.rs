//! Archive-extraction collaborator seam (§6).
//!
//! Real extraction (zip/tar/7z) is explicitly out of scope for this engine;
//! `Scheduler` only needs to know whether a completed file's extension is
//! one the host application can handle, and to await the collaborator's
//! verdict off the async runtime's I/O loop.

use anyhow::Result;
use std::path::Path;

/// Extensions the reference extractor collaborator supports. An engine
/// using `NullExtractor` treats every one of these as "skipped" rather than
/// attempted, since no extraction crate is linked into this workspace.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".zip", ".tar", ".tar.gz", ".tgz", ".7z"];

pub fn has_supported_extension(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Archive extraction collaborator: `extract(path) -> (success, message)`.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<(bool, String)>;
}

/// Default extractor: always reports the format unsupported. A host
/// application that wants real extraction provides its own `Extractor`.
pub struct NullExtractor;

impl Extractor for NullExtractor {
    fn extract(&self, path: &Path) -> Result<(bool, String)> {
        Ok((
            false,
            format!("no extractor configured for {}", path.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_supported_extensions() {
        assert!(has_supported_extension("archive.zip"));
        assert!(has_supported_extension("backup.tar.gz"));
        assert!(has_supported_extension("backup.tgz"));
        assert!(has_supported_extension("data.7z"));
        assert!(!has_supported_extension("document.pdf"));
    }

    #[test]
    fn null_extractor_always_skips() {
        let e = NullExtractor;
        let (ok, _msg) = e.extract(Path::new("file.zip")).unwrap();
        assert!(!ok);
    }
}
