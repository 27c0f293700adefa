//! `SegmentedDownload`: single-URL, multi-connection, resumable transfer.

use crate::error::EngineError;
use crate::fetch_head::{self, HeadResult};
use crate::part::{self, PartInfo};
use crate::rate_limiter::RateLimiter;
use crate::retry::{classify, run_with_retry, ErrorKind, RetryPolicy, SegmentError};
use crate::safe_resume::{validate_for_resume, StoredMetadata};
use crate::segmenter::{plan_segments, Segment};
use crate::storage::{StorageWriter, StorageWriterBuilder};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Chunk size for streamed reads.
const CHUNK_SIZE: usize = 64 * 1024;
/// Bytes of uninterrupted progress within one attempt that reset the retry counter.
const HEARTBEAT_RESET_BYTES: u64 = 512 * 1024;

/// Opaque, stable task identifier: milliseconds since epoch at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Downloading,
    Paused,
    Extracting,
    Completed,
    Error,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Canceled
        )
    }
}

/// Manual-reset pause gate, checked between chunks by every part worker.
/// Polling rather than an async wait since part workers run on blocking
/// threads (curl's transfer loop is synchronous).
#[derive(Default)]
struct PauseGate {
    paused: AtomicBool,
}

impl PauseGate {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn wait_while_paused(&self, cancel: &AtomicBool) {
        while self.is_paused() && !cancel.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

/// On-disk/serialized snapshot of a `SegmentedDownload`, the per-task JSON
/// state sidecar at `<download_dir>/.parts/<filename>.state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedDownloadState {
    #[serde(rename = "type")]
    pub kind: String, // always "file"
    pub id: TaskId,
    pub url: String,
    pub filename: String,
    pub download_dir: PathBuf,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub speed: f64,
    pub supports_resume: bool,
    pub num_connections: usize,
    pub auto_extract: bool,
    pub extraction_skipped: bool,
    pub speed_limit_kbps: u32,
    pub error_message: Option<String>,
    pub status: TaskStatus,
    pub parts_info: Vec<PartInfo>,
    pub headers: HashMap<String, String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: i64,
}

struct Inner {
    url: String,
    filename: String,
    download_dir: PathBuf,
    total_size: u64,
    downloaded_size: u64,
    speed: f64,
    supports_resume: bool,
    num_connections: usize,
    auto_extract: bool,
    extraction_skipped: bool,
    speed_limit_kbps: u32,
    error_message: Option<String>,
    status: TaskStatus,
    parts_info: Vec<PartInfo>,
    headers: HashMap<String, String>,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// A single-URL, multi-connection, resumable download.
pub struct SegmentedDownload {
    pub id: TaskId,
    pub created_at: i64,
    inner: Mutex<Inner>,
    rate_limiter: Mutex<Arc<RateLimiter>>,
    pause_gate: PauseGate,
    cancel_flag: Arc<AtomicBool>,
    retry_policy: RetryPolicy,
}

impl SegmentedDownload {
    pub fn new(
        id: TaskId,
        created_at: i64,
        url: String,
        filename: String,
        download_dir: PathBuf,
        headers: HashMap<String, String>,
        num_connections: usize,
        auto_extract: bool,
        speed_limit_kbps: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        SegmentedDownload {
            id,
            created_at,
            inner: Mutex::new(Inner {
                url,
                filename,
                download_dir,
                total_size: 0,
                downloaded_size: 0,
                speed: 0.0,
                supports_resume: false,
                num_connections: num_connections.max(1),
                auto_extract,
                extraction_skipped: false,
                speed_limit_kbps,
                error_message: None,
                status: TaskStatus::Pending,
                parts_info: Vec::new(),
                headers,
                etag: None,
                last_modified: None,
            }),
            rate_limiter: Mutex::new(Arc::new(RateLimiter::new(speed_limit_kbps))),
            pause_gate: PauseGate::default(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            retry_policy,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().unwrap().status
    }

    pub fn final_filepath(&self) -> PathBuf {
        let inner = self.inner.lock().unwrap();
        inner.download_dir.join(&inner.filename)
    }

    fn set_status(&self, status: TaskStatus) {
        self.inner.lock().unwrap().status = status;
    }

    /// Forces a status, bypassing the transition rules `pause`/`resume`
    /// apply. Used only by startup recovery, to demote a task found
    /// DOWNLOADING or EXTRACTING after a crash to PAUSED.
    pub fn set_status_for_recovery(&self, status: TaskStatus) {
        self.set_status(status);
    }

    pub fn auto_extract(&self) -> bool {
        self.inner.lock().unwrap().auto_extract
    }

    /// Scheduler admission: PENDING/QUEUED -> DOWNLOADING.
    pub fn set_downloading(&self) {
        self.set_status(TaskStatus::Downloading);
    }

    /// Scheduler demotion for tasks left waiting past the ceiling.
    pub fn set_queued(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == TaskStatus::Pending {
            inner.status = TaskStatus::Queued;
        }
    }

    /// Marks a completed download's extension as not eligible for
    /// extraction, without ever entering EXTRACTING.
    pub fn mark_extraction_skipped(&self) {
        self.inner.lock().unwrap().extraction_skipped = true;
    }

    /// Called by the scheduler immediately before invoking the `Extractor`
    /// collaborator on a just-completed download. Only valid from COMPLETED.
    pub fn begin_extraction(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != TaskStatus::Completed {
            anyhow::bail!("begin_extraction called from non-COMPLETED status");
        }
        inner.status = TaskStatus::Extracting;
        Ok(())
    }

    /// Settles the single EXTRACTING -> COMPLETED|ERROR assignment after the
    /// extractor collaborator returns. `skipped` marks an unsupported
    /// extension rather than a failure.
    pub fn finish_extraction(&self, outcome: Result<bool, String>) {
        let mut inner = self.inner.lock().unwrap();
        match outcome {
            Ok(extracted) => {
                inner.extraction_skipped = !extracted;
                inner.status = TaskStatus::Completed;
            }
            Err(message) => {
                inner.error_message = Some(message);
                inner.status = TaskStatus::Error;
            }
        }
    }

    /// Swaps the rate limiter atomically; takes effect on the next chunk.
    pub fn set_speed_limit(&self, kbps: u32) {
        self.inner.lock().unwrap().speed_limit_kbps = kbps;
        *self.rate_limiter.lock().unwrap() = Arc::new(RateLimiter::new(kbps));
    }

    pub fn speed_limit_kbps(&self) -> u32 {
        self.inner.lock().unwrap().speed_limit_kbps
    }

    /// Replaces the source URL (used when a signed URL expires).
    pub fn update_url(&self, new_url: String) {
        self.inner.lock().unwrap().url = new_url;
    }

    pub fn url(&self) -> String {
        self.inner.lock().unwrap().url.clone()
    }

    /// Idempotent: pausing an already-paused (or terminal) task is a no-op.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == TaskStatus::Downloading {
            inner.status = TaskStatus::Paused;
        }
        drop(inner);
        self.pause_gate.pause();
    }

    /// Idempotent: resuming a non-paused task is a no-op.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == TaskStatus::Paused {
            inner.status = TaskStatus::Downloading;
        }
        drop(inner);
        self.pause_gate.resume();
    }

    /// Best-effort-immediate: sets status to CANCELED and signals part
    /// workers. Callers must await the task runner (the `start()` future)
    /// to observe file handles released before deleting files.
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.status.is_terminal() {
                inner.status = TaskStatus::Canceled;
            }
        }
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.pause_gate.resume(); // unblock anyone waiting on the pause gate
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Renames the final path and all persisted artifacts. Rejected while
    /// DOWNLOADING to avoid racing an active writer.
    pub fn rename(&self, new_filename: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == TaskStatus::Downloading {
            anyhow::bail!("cannot rename a task while DOWNLOADING; pause it first");
        }
        let old_state = part::state_path(&inner.download_dir, &inner.filename);
        let new_state = part::state_path(&inner.download_dir, new_filename);
        if old_state.exists() {
            std::fs::rename(&old_state, &new_state)
                .with_context(|| format!("renaming {} to {}", old_state.display(), new_state.display()))?;
        }
        for i in 0..inner.parts_info.len() {
            let old_part = part::part_path(&inner.download_dir, &inner.filename, i);
            if old_part.exists() {
                let new_part = part::part_path(&inner.download_dir, new_filename, i);
                std::fs::rename(&old_part, &new_part)
                    .with_context(|| format!("renaming part {}", old_part.display()))?;
            }
        }
        let old_final = inner.download_dir.join(&inner.filename);
        let new_final = inner.download_dir.join(new_filename);
        if old_final.exists() {
            std::fs::rename(&old_final, &new_final)
                .with_context(|| format!("renaming {} to {}", old_final.display(), new_final.display()))?;
        }
        inner.filename = new_filename.to_string();
        Ok(())
    }

    /// Removes the final file, state file, and any remaining part files.
    pub fn delete_files(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let final_path = inner.download_dir.join(&inner.filename);
        let _ = std::fs::remove_file(&final_path);
        let _ = std::fs::remove_file(part::state_path(&inner.download_dir, &inner.filename));
        for i in 0..inner.parts_info.len() {
            let _ = std::fs::remove_file(part::part_path(&inner.download_dir, &inner.filename, i));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SegmentedDownloadState {
        let inner = self.inner.lock().unwrap();
        SegmentedDownloadState {
            kind: "file".to_string(),
            id: self.id,
            url: inner.url.clone(),
            filename: inner.filename.clone(),
            download_dir: inner.download_dir.clone(),
            total_size: inner.total_size,
            downloaded_size: inner.downloaded_size,
            speed: inner.speed,
            supports_resume: inner.supports_resume,
            num_connections: inner.num_connections,
            auto_extract: inner.auto_extract,
            extraction_skipped: inner.extraction_skipped,
            speed_limit_kbps: inner.speed_limit_kbps,
            error_message: inner.error_message.clone(),
            status: inner.status,
            parts_info: inner.parts_info.clone(),
            headers: inner.headers.clone(),
            etag: inner.etag.clone(),
            last_modified: inner.last_modified.clone(),
            created_at: self.created_at,
        }
    }

    /// Serializes state to the per-task JSON sidecar. Writes whole-file
    /// via a sibling-then-rename so a crash mid-write never leaves a
    /// half-written (unparseable) state file.
    pub fn save_state(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        part::ensure_parts_dir(&inner.download_dir)?;
        let path = part::state_path(&inner.download_dir, &inner.filename);
        drop(inner);
        let state = self.snapshot();
        let json = serde_json::to_vec_pretty(&state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Loads state from `path` into a new `SegmentedDownload`. Returns
    /// `Ok(None)` if the file does not exist.
    pub fn load_state(
        path: &Path,
        retry_policy: RetryPolicy,
    ) -> Result<Option<SegmentedDownload>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        let state: SegmentedDownloadState = serde_json::from_slice(&data)?;
        let task = SegmentedDownload {
            id: state.id,
            created_at: state.created_at,
            inner: Mutex::new(Inner {
                url: state.url,
                filename: state.filename,
                download_dir: state.download_dir,
                total_size: state.total_size,
                downloaded_size: state.downloaded_size,
                speed: state.speed,
                supports_resume: state.supports_resume,
                num_connections: state.num_connections,
                auto_extract: state.auto_extract,
                extraction_skipped: state.extraction_skipped,
                speed_limit_kbps: state.speed_limit_kbps,
                error_message: state.error_message,
                status: state.status,
                parts_info: state.parts_info,
                headers: state.headers,
                etag: state.etag,
                last_modified: state.last_modified,
            }),
            rate_limiter: Mutex::new(Arc::new(RateLimiter::new(state.speed_limit_kbps))),
            pause_gate: PauseGate::default(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            retry_policy,
        };
        Ok(Some(task))
    }

    /// Drives a cold or cold-resumed download to a terminal state.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.set_status(TaskStatus::Downloading);

        let needs_discovery = self.inner.lock().unwrap().parts_info.is_empty();
        if needs_discovery {
            self.discover_and_plan().await?;
        } else {
            self.reconcile_on_disk()?;
        }
        self.save_state()?;

        let (download_dir, filename, parts) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.download_dir.clone(),
                inner.filename.clone(),
                inner.parts_info.clone(),
            )
        };
        part::ensure_parts_dir(&download_dir)?;

        let speed_monitor = tokio::spawn(Self::speed_monitor(Arc::clone(&self)));

        let mut join_set = tokio::task::JoinSet::new();
        for (index, part_info) in parts.into_iter().enumerate() {
            let task = Arc::clone(&self);
            let download_dir = download_dir.clone();
            let filename = filename.clone();
            join_set.spawn_blocking(move || {
                task.run_part_worker(index, part_info, &download_dir, &filename)
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    self.cancel_flag.store(true, Ordering::SeqCst);
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!(join_err));
                    }
                }
            }
        }

        speed_monitor.abort();

        if let Some(err) = first_error {
            if !self.is_canceled_by_user() {
                let mut inner = self.inner.lock().unwrap();
                inner.status = TaskStatus::Error;
                inner.error_message = Some(err.to_string());
            }
            self.save_state()?;
            return Err(err);
        }

        if self.status() == TaskStatus::Canceled {
            self.save_state()?;
            return Ok(());
        }

        self.merge_parts(&download_dir, &filename)?;
        self.set_status(TaskStatus::Completed);
        self.save_state()?;
        Ok(())
    }

    fn is_canceled_by_user(&self) -> bool {
        self.status() == TaskStatus::Canceled
    }

    async fn discover_and_plan(self: &Arc<Self>) -> Result<()> {
        let (url, headers) = {
            let inner = self.inner.lock().unwrap();
            (inner.url.clone(), inner.headers.clone())
        };
        let head = {
            let url = url.clone();
            let headers = headers.clone();
            tokio::task::spawn_blocking(move || fetch_head::probe(&url, &headers)).await??
        };

        self.validate_resume_if_resuming(&head)?;

        let mut inner = self.inner.lock().unwrap();
        let total_size = head.content_length.unwrap_or(0);
        inner.total_size = total_size;
        inner.etag = head.etag.clone();
        inner.last_modified = head.last_modified.clone();
        inner.supports_resume = head.accept_ranges && total_size > 0;

        if inner.supports_resume {
            let segments: Vec<Segment> = plan_segments(total_size, inner.num_connections);
            inner.parts_info = segments.into_iter().map(PartInfo::from_segment).collect();
        } else {
            inner.num_connections = 1;
            inner.parts_info = vec![PartInfo::unbounded()];
        }
        drop(inner);
        self.reconcile_on_disk()
    }

    fn validate_resume_if_resuming(&self, head: &HeadResult) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let has_prior_state = !inner.parts_info.is_empty() || inner.total_size > 0;
        if !has_prior_state {
            return Ok(());
        }
        let stored = StoredMetadata {
            total_size: if inner.total_size > 0 {
                Some(inner.total_size)
            } else {
                None
            },
            etag: inner.etag.as_deref(),
            last_modified: inner.last_modified.as_deref(),
        };
        validate_for_resume(stored, head).map_err(|e| anyhow::anyhow!(e))
    }

    fn reconcile_on_disk(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let download_dir = inner.download_dir.clone();
        let filename = inner.filename.clone();
        let downloaded = part::reconcile_parts(&download_dir, &filename, &mut inner.parts_info)?;
        inner.downloaded_size = downloaded;
        Ok(())
    }

    async fn speed_monitor(self: Arc<Self>) {
        let mut last_sample = Instant::now();
        let mut last_bytes = self.inner.lock().unwrap().downloaded_size;
        let mut since_save = Instant::now();
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.status().is_terminal() {
                return;
            }
            let now = Instant::now();
            let elapsed = now.duration_since(last_sample).as_secs_f64().max(0.001);
            let bytes = self.inner.lock().unwrap().downloaded_size;
            let speed = ((bytes.saturating_sub(last_bytes)) as f64) / elapsed;
            {
                let mut inner = self.inner.lock().unwrap();
                inner.speed = speed;
            }
            last_bytes = bytes;
            last_sample = now;

            if since_save.elapsed() >= Duration::from_secs(5) {
                let _ = self.save_state();
                since_save = Instant::now();
            }
        }
    }

    /// Runs one segment to completion (blocking; invoked via spawn_blocking).
    fn run_part_worker(
        &self,
        index: usize,
        mut part_info: PartInfo,
        download_dir: &Path,
        filename: &str,
    ) -> Result<()> {
        let path = part::part_path(download_dir, filename, index);
        // Bytes written by the *current* attempt, reset at the start of each
        // one; polled by `run_with_retry` after a failure to decide whether
        // this attempt made enough progress to earn a fresh retry budget.
        let heartbeat_bytes = std::cell::Cell::new(0u64);
        let mut auth_expired = false;

        let result = run_with_retry(
            &self.retry_policy,
            || {
                if self.is_canceled() || part_info.is_complete() {
                    return Ok(());
                }
                heartbeat_bytes.set(0);
                match self.transfer_segment(&path, &mut part_info, &heartbeat_bytes) {
                    Ok(()) => {
                        self.update_part_progress(index, &part_info);
                        Ok(())
                    }
                    Err(seg_err) => {
                        if matches!(classify(&seg_err), ErrorKind::AuthExpired) {
                            auth_expired = true;
                        }
                        Err(seg_err)
                    }
                }
            },
            || heartbeat_bytes.get() >= HEARTBEAT_RESET_BYTES,
        );

        if auth_expired {
            return Err(anyhow::anyhow!(EngineError::AuthExpired));
        }
        result.map_err(|e| anyhow::anyhow!("segment {} failed permanently: {}", index, e))
    }

    fn transfer_segment(
        &self,
        path: &Path,
        part_info: &mut PartInfo,
        heartbeat_bytes: &std::cell::Cell<u64>,
    ) -> std::result::Result<(), SegmentError> {
        let (url, headers, rate_limiter) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.url.clone(),
                inner.headers.clone(),
                Arc::clone(&*self.rate_limiter.lock().unwrap()),
            )
        };

        let seg_len = part_info.end.map(|end| end + 1 - part_info.start);
        // Part files are never preallocated: `reconcile_parts` derives
        // `current` straight from on-disk file size, so the size must track
        // bytes actually written rather than the full segment length up
        // front. A part file already holding bytes from an earlier attempt
        // (or a prior process's resume) is reopened in place; `create` would
        // truncate it and throw away progress within this same run.
        let writer = if path.exists() && part_info.current > part_info.start {
            StorageWriter::open_existing(path).map_err(io_err)?
        } else {
            StorageWriterBuilder::create(path).map_err(io_err)?.build()
        };

        let mut easy = curl::easy::Easy::new();
        easy.url(&url).map_err(SegmentError::Curl)?;
        easy.follow_location(true).map_err(SegmentError::Curl)?;
        easy.low_speed_limit(1024).map_err(SegmentError::Curl)?;
        easy.low_speed_time(Duration::from_secs(60))
            .map_err(SegmentError::Curl)?;
        easy.timeout(Duration::from_secs(3600))
            .map_err(SegmentError::Curl)?;

        let mut list = curl::easy::List::new();
        for (k, v) in &headers {
            let _ = list.append(&format!("{}: {}", k.trim(), v.trim()));
        }
        if part_info.end.is_some() || part_info.current > 0 {
            let _ = list.append(&format!("Range: {}", part_info.range_header_value()));
        }
        easy.http_headers(list).map_err(SegmentError::Curl)?;

        let base_offset = part_info.current - part_info.start;
        let written = AtomicU64::new(0);
        let storage_err: Mutex<Option<std::io::Error>> = Mutex::new(None);
        let cancel = Arc::clone(&self.cancel_flag);

        {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| {
                    if cancel.load(Ordering::SeqCst) {
                        return Ok(0);
                    }
                    self.pause_gate.wait_while_paused(&cancel);
                    if cancel.load(Ordering::SeqCst) {
                        return Ok(0);
                    }

                    for chunk in data.chunks(CHUNK_SIZE) {
                        rate_limiter.acquire(chunk.len() as u64);
                        let offset = base_offset + written.load(Ordering::SeqCst);
                        if let Err(e) = writer.write_at(offset, chunk) {
                            *storage_err.lock().unwrap() =
                                Some(std::io::Error::new(std::io::ErrorKind::Other, e));
                            return Ok(0);
                        }
                        written.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                        heartbeat_bytes.set(heartbeat_bytes.get() + chunk.len() as u64);
                    }
                    Ok(data.len())
                })
                .map_err(SegmentError::Curl)?;
            transfer.perform().map_err(SegmentError::Curl)?;
        }

        if let Some(e) = storage_err.into_inner().unwrap() {
            return Err(SegmentError::Storage(e));
        }

        let code = easy.response_code().unwrap_or(0);
        let is_ranged = part_info.current > part_info.start || part_info.end.is_some();
        if is_ranged && code != 206 && code != 200 {
            return Err(SegmentError::Http(code));
        }
        if !is_ranged && !(200..300).contains(&code) {
            return Err(SegmentError::Http(code));
        }

        let got = written.load(Ordering::SeqCst);
        if let Some(len) = seg_len {
            if got != len - base_offset {
                return Err(SegmentError::PartialTransfer {
                    expected: len - base_offset,
                    received: got,
                });
            }
        }

        part_info.current += got;
        Ok(())
    }

    fn update_part_progress(&self, index: usize, part_info: &PartInfo) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.parts_info.get_mut(index) {
            *slot = *part_info;
        }
        inner.downloaded_size = inner.parts_info.iter().map(|p| p.downloaded()).sum();
    }

    fn merge_parts(&self, download_dir: &Path, filename: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let num_parts = inner.parts_info.len();
        drop(inner);

        let final_path = download_dir.join(filename);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = crate::storage::temp_path(&final_path);
        let mut builder = StorageWriterBuilder::create(&tmp_path)?;
        let total: u64 = self.inner.lock().unwrap().total_size;
        if total > 0 {
            builder.preallocate(total)?;
        }
        let writer = builder.build();

        let mut offset = 0u64;
        for i in 0..num_parts {
            let part_path = part::part_path(download_dir, filename, i);
            let bytes = std::fs::read(&part_path)
                .with_context(|| format!("reading part {}", part_path.display()))?;
            writer.write_at(offset, &bytes)?;
            offset += bytes.len() as u64;
        }
        writer.sync()?;
        writer.finalize(&final_path)?;

        for i in 0..num_parts {
            let _ = std::fs::remove_file(part::part_path(download_dir, filename, i));
        }
        Ok(())
    }
}

fn io_err(e: anyhow::Error) -> SegmentError {
    SegmentError::Storage(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn new_task(dir: &Path, url: &str) -> Arc<SegmentedDownload> {
        Arc::new(SegmentedDownload::new(
            TaskId(1),
            0,
            url.to_string(),
            "file.bin".to_string(),
            dir.to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
            RetryPolicy::default(),
        ))
    }

    #[test]
    fn pause_resume_cancel_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let task = new_task(dir.path(), "https://example.invalid/file.bin");
        task.set_status(TaskStatus::Downloading);
        task.pause();
        task.pause();
        assert_eq!(task.status(), TaskStatus::Paused);
        task.resume();
        task.resume();
        assert_eq!(task.status(), TaskStatus::Downloading);
        task.cancel();
        task.cancel();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(task.is_canceled());
    }

    #[test]
    fn save_and_load_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let task = new_task(dir.path(), "https://example.invalid/file.bin");
        {
            let mut inner = task.inner.lock().unwrap();
            inner.total_size = 100;
            inner.parts_info = vec![PartInfo {
                start: 0,
                end: Some(99),
                current: 50,
            }];
            inner.downloaded_size = 50;
        }
        task.save_state().unwrap();

        let path = part::state_path(dir.path(), "file.bin");
        let loaded = SegmentedDownload::load_state(&path, RetryPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, task.id);
        let snap = loaded.snapshot();
        assert_eq!(snap.total_size, 100);
        assert_eq!(snap.downloaded_size, 50);
        assert_eq!(snap.parts_info[0].current, 50);
    }

    #[test]
    fn set_speed_limit_swaps_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let task = new_task(dir.path(), "https://example.invalid/file.bin");
        assert_eq!(task.speed_limit_kbps(), 0);
        task.set_speed_limit(256);
        assert_eq!(task.speed_limit_kbps(), 256);
        assert!(!task.rate_limiter.lock().unwrap().is_unlimited());
    }

    #[test]
    fn rename_rejected_while_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let task = new_task(dir.path(), "https://example.invalid/file.bin");
        task.set_status(TaskStatus::Downloading);
        assert!(task.rename("new.bin").is_err());
    }
}
