//! Disk I/O and file lifecycle.
//!
//! Preallocates files (fallocate on Linux when available, else set_len),
//! supports concurrent offset writes (pwrite), fsync policy, and atomic
//! finalize (rename to the final name). Used both for a segment's own part
//! file (written directly, no rename needed — a partial part file is valid
//! resumable state) and for the final merge target (written to a temp
//! sibling of the destination path, then renamed atomically once complete).

mod builder;
mod writer;

pub use builder::StorageWriterBuilder;
pub use writer::StorageWriter;

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path (e.g. `file.iso` → `file.iso.part`).
pub fn temp_path(final_path: &std::path::Path) -> std::path::PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(".part");
    std::path::PathBuf::from(o)
}
