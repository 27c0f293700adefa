//! Per-segment progress tracking and on-disk part-file layout.
//!
//! Each segment of a `SegmentedDownload` has its own part file at
//! `<download_dir>/.parts/<filename>.partN`. Progress for a segment is the
//! triple `{start, end, current}`; `current` is reconciled from the actual
//! size of the part file on disk rather than trusted blindly from the last
//! persisted JSON state, so a crash between a write and a `save_state` call
//! is always recoverable.

use crate::segmenter::Segment;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Progress for one segment. `end = None` is the sentinel for "until EOF",
/// used when the server does not support byte ranges (single connection).
///
/// Invariant: `start <= current <= end + 1` when `end` is concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub start: u64,
    pub end: Option<u64>,
    pub current: u64,
}

impl PartInfo {
    pub fn from_segment(seg: Segment) -> Self {
        PartInfo {
            start: seg.start,
            end: Some(seg.end.saturating_sub(1)),
            current: seg.start,
        }
    }

    /// A single unbounded part covering the whole file (range unsupported).
    pub fn unbounded() -> Self {
        PartInfo {
            start: 0,
            end: None,
            current: 0,
        }
    }

    /// Bytes downloaded so far for this part.
    pub fn downloaded(&self) -> u64 {
        self.current.saturating_sub(self.start)
    }

    /// True once `current` has reached (or passed) the end of the range.
    /// Always false for an unbounded part; the caller must track EOF itself.
    pub fn is_complete(&self) -> bool {
        match self.end {
            Some(end) => self.current > end,
            None => false,
        }
    }

    /// The HTTP Range header value for resuming from `current`.
    pub fn range_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.current, end),
            None => format!("bytes={}-", self.current),
        }
    }
}

/// Directory holding part files and the state sidecar for a download directory.
pub fn parts_dir(download_dir: &Path) -> PathBuf {
    download_dir.join(".parts")
}

/// Path to segment `i`'s part file for `filename` under `download_dir`.
pub fn part_path(download_dir: &Path, filename: &str, index: usize) -> PathBuf {
    parts_dir(download_dir).join(format!("{filename}.part{index}"))
}

/// Path to the JSON state sidecar for `filename` under `download_dir`.
pub fn state_path(download_dir: &Path, filename: &str) -> PathBuf {
    parts_dir(download_dir).join(format!("{filename}.state.json"))
}

/// Reconciles `parts` against the actual size of each part file on disk.
/// Missing part files are treated as zero bytes downloaded (fresh start for
/// that segment). Recomputes and returns total `downloaded_size`.
pub fn reconcile_parts(download_dir: &Path, filename: &str, parts: &mut [PartInfo]) -> Result<u64> {
    let mut downloaded_size = 0u64;
    for (i, part) in parts.iter_mut().enumerate() {
        let path = part_path(download_dir, filename, i);
        let on_disk = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(e).with_context(|| format!("reading part file {}", path.display()))
            }
        };
        part.current = part.start + on_disk;
        downloaded_size += part.downloaded();
    }
    Ok(downloaded_size)
}

pub fn ensure_parts_dir(download_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(parts_dir(download_dir))
        .with_context(|| format!("creating {}", parts_dir(download_dir).display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_info_from_segment() {
        let seg = Segment { start: 0, end: 100 };
        let p = PartInfo::from_segment(seg);
        assert_eq!(p.start, 0);
        assert_eq!(p.end, Some(99));
        assert_eq!(p.current, 0);
        assert!(!p.is_complete());
    }

    #[test]
    fn part_info_completion() {
        let mut p = PartInfo {
            start: 10,
            end: Some(19),
            current: 10,
        };
        assert!(!p.is_complete());
        p.current = 20;
        assert!(p.is_complete());
        assert_eq!(p.downloaded(), 10);
    }

    #[test]
    fn range_header_bounded_and_unbounded() {
        let bounded = PartInfo {
            start: 5,
            end: Some(9),
            current: 7,
        };
        assert_eq!(bounded.range_header_value(), "bytes=7-9");

        let unbounded = PartInfo::unbounded();
        assert_eq!(unbounded.range_header_value(), "bytes=0-");
    }

    #[test]
    fn reconcile_reads_on_disk_sizes() {
        let dir = tempfile::tempdir().unwrap();
        ensure_parts_dir(dir.path()).unwrap();
        std::fs::write(part_path(dir.path(), "f.bin", 0), vec![0u8; 30]).unwrap();
        // part 1 missing: fresh start

        let mut parts = vec![
            PartInfo {
                start: 0,
                end: Some(49),
                current: 0,
            },
            PartInfo {
                start: 50,
                end: Some(99),
                current: 0,
            },
        ];
        let total = reconcile_parts(dir.path(), "f.bin", &mut parts).unwrap();
        assert_eq!(parts[0].current, 30);
        assert_eq!(parts[1].current, 50);
        assert_eq!(total, 30);
    }
}
