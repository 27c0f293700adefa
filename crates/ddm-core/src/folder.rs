//! `FolderAggregator`: recursive remote-folder download composed of many
//! `SegmentedDownload` sub-tasks.

use crate::part;
use crate::provider::MetadataProvider;
use crate::retry::RetryPolicy;
use crate::task::{SegmentedDownload, TaskId, TaskStatus};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default bound on files downloaded at once within one folder, per
/// `original_source/server/core/drive_task.py`'s `asyncio.Semaphore(2)`.
const DEFAULT_MAX_CONCURRENT_FILES: usize = 2;

/// Characters allowed in a path segment derived from a remote entry's name.
/// Narrower than `url_model`'s filesystem sanitizer: this one also has to
/// produce stable relative paths out of arbitrary (not attacker-controlled,
/// but unconstrained) cloud-drive names.
fn sanitize_entry_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-' | '(' | ')'))
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// On-disk manifest for a folder aggregate, stored alongside task sidecars
/// as `.parts/folder-<id>.state.json`. Sub-tasks are referenced by
/// `(download_dir, filename)` rather than embedded, since each sub-task
/// already owns its own authoritative sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderAggregatorState {
    #[serde(rename = "type")]
    pub kind: String, // always "folder"
    pub id: TaskId,
    pub created_at: i64,
    pub folder_id: String,
    pub name: String,
    pub download_dir: PathBuf,
    pub status: TaskStatus,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub speed: f64,
    pub speed_limit_kbps: u32,
    pub error_message: Option<String>,
    pub scanned: bool,
    pub sub_task_refs: Vec<(PathBuf, String)>,
    pub max_concurrent_files: usize,
    pub num_connections_per_file: usize,
}

fn manifest_filename(id: TaskId) -> String {
    format!("folder-{}", id.0)
}

struct FileEntry {
    relative_path: PathBuf,
    file_id: String,
    size: u64,
}

struct Inner {
    folder_id: String,
    name: String,
    download_dir: PathBuf,
    status: TaskStatus,
    total_size: u64,
    downloaded_size: u64,
    speed: f64,
    speed_limit_kbps: u32,
    error_message: Option<String>,
    scanned: bool,
    sub_tasks: Vec<Arc<SegmentedDownload>>,
}

/// A recursive remote-folder download, fanning out into one
/// `SegmentedDownload` per file.
pub struct FolderAggregator {
    pub id: TaskId,
    pub created_at: i64,
    inner: Mutex<Inner>,
    cancel_flag: Arc<AtomicBool>,
    max_concurrent_files: usize,
    num_connections_per_file: usize,
    retry_policy: RetryPolicy,
}

impl FolderAggregator {
    pub fn new(
        id: TaskId,
        created_at: i64,
        folder_id: String,
        name: String,
        download_dir: PathBuf,
        max_concurrent_files: usize,
        num_connections_per_file: usize,
        speed_limit_kbps: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        FolderAggregator {
            id,
            created_at,
            inner: Mutex::new(Inner {
                folder_id,
                name,
                download_dir,
                status: TaskStatus::Pending,
                total_size: 0,
                downloaded_size: 0,
                speed: 0.0,
                speed_limit_kbps,
                error_message: None,
                scanned: false,
                sub_tasks: Vec::new(),
            }),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            max_concurrent_files: max_concurrent_files.max(1),
            num_connections_per_file: num_connections_per_file.max(1),
            retry_policy,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().unwrap().status
    }

    pub fn sub_tasks(&self) -> Vec<Arc<SegmentedDownload>> {
        self.inner.lock().unwrap().sub_tasks.clone()
    }

    fn set_status(&self, status: TaskStatus) {
        self.inner.lock().unwrap().status = status;
    }

    /// Updates this aggregate's own limit and propagates it to every
    /// sub-task. The Python reference this engine is modeled on does *not*
    /// propagate; this implementation deliberately corrects that, matching
    /// the per-task contract every `SegmentedDownload` otherwise honors.
    pub fn set_speed_limit(&self, kbps: u32) {
        let sub_tasks = {
            let mut inner = self.inner.lock().unwrap();
            inner.speed_limit_kbps = kbps;
            inner.sub_tasks.clone()
        };
        for task in sub_tasks {
            task.set_speed_limit(kbps);
        }
    }

    pub fn pause(&self) {
        let sub_tasks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == TaskStatus::Downloading {
                inner.status = TaskStatus::Paused;
            }
            inner.sub_tasks.clone()
        };
        for task in sub_tasks {
            task.pause();
        }
    }

    pub fn resume(&self) {
        let sub_tasks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status == TaskStatus::Paused {
                inner.status = TaskStatus::Downloading;
            }
            inner.sub_tasks.clone()
        };
        for task in sub_tasks {
            task.resume();
        }
    }

    pub fn cancel(&self) {
        let sub_tasks = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.status.is_terminal() {
                inner.status = TaskStatus::Canceled;
            }
            inner.sub_tasks.clone()
        };
        self.cancel_flag.store(true, Ordering::SeqCst);
        for task in sub_tasks {
            task.cancel();
        }
    }

    /// Forces a status, bypassing `pause`/`resume`'s transition rules. Used
    /// only by startup recovery.
    pub fn set_status_for_recovery(&self, status: TaskStatus) {
        self.set_status(status);
    }

    /// Scheduler admission: PENDING/QUEUED -> DOWNLOADING. A folder counts
    /// as one unit against the global ceiling regardless of its own
    /// sub-task fan-out.
    pub fn set_downloading(&self) {
        self.set_status(TaskStatus::Downloading);
    }

    /// Scheduler demotion for folders left waiting past the ceiling.
    pub fn set_queued(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == TaskStatus::Pending {
            inner.status = TaskStatus::Queued;
        }
    }

    /// Renames the aggregate's display name. Unlike a `SegmentedDownload`
    /// rename, this never touches the filesystem: each sub-task keeps its
    /// own directory and filename, which were already derived from the
    /// remote folder tree at scan time. Rejected while DOWNLOADING, same as
    /// a single-file task.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == TaskStatus::Downloading {
            anyhow::bail!("cannot rename a folder while DOWNLOADING; pause it first");
        }
        inner.name = new_name.to_string();
        Ok(())
    }

    /// Deletes every sub-task's files, then the folder's own manifest.
    pub fn delete_files(&self) -> Result<()> {
        let (base_dir, sub_tasks) = {
            let inner = self.inner.lock().unwrap();
            (inner.download_dir.clone(), inner.sub_tasks.clone())
        };
        for task in &sub_tasks {
            task.delete_files()?;
        }
        let _ = std::fs::remove_file(part::state_path(&base_dir, &manifest_filename(self.id)));
        Ok(())
    }

    /// Drives the whole folder to completion: scans recursively (if not
    /// already scanned), builds one sub-task per file, then runs sub-tasks
    /// at bounded concurrency. ERROR in any sub-task cancels the siblings
    /// and fails the aggregate.
    pub fn snapshot(&self) -> FolderAggregatorState {
        let inner = self.inner.lock().unwrap();
        let sub_task_refs = inner
            .sub_tasks
            .iter()
            .map(|t| {
                let snap = t.snapshot();
                (snap.download_dir, snap.filename)
            })
            .collect();
        FolderAggregatorState {
            kind: "folder".to_string(),
            id: self.id,
            created_at: self.created_at,
            folder_id: inner.folder_id.clone(),
            name: inner.name.clone(),
            download_dir: inner.download_dir.clone(),
            status: inner.status,
            total_size: inner.total_size,
            downloaded_size: inner.downloaded_size,
            speed: inner.speed,
            speed_limit_kbps: inner.speed_limit_kbps,
            error_message: inner.error_message.clone(),
            scanned: inner.scanned,
            sub_task_refs,
            max_concurrent_files: self.max_concurrent_files,
            num_connections_per_file: self.num_connections_per_file,
        }
    }

    pub fn save_state(&self) -> Result<()> {
        let base_dir = self.inner.lock().unwrap().download_dir.clone();
        part::ensure_parts_dir(&base_dir)?;
        let path = part::state_path(&base_dir, &manifest_filename(self.id));
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Reloads a folder manifest and every sub-task it references. A
    /// sub-task whose own sidecar has gone missing is dropped with a
    /// warning rather than failing the whole folder's recovery.
    pub fn load_state(
        path: &std::path::Path,
        retry_policy: RetryPolicy,
    ) -> Result<Option<FolderAggregator>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        let state: FolderAggregatorState = serde_json::from_slice(&data)?;

        let mut sub_tasks = Vec::with_capacity(state.sub_task_refs.len());
        for (dir, filename) in &state.sub_task_refs {
            let sidecar = part::state_path(dir, filename);
            match SegmentedDownload::load_state(&sidecar, retry_policy) {
                Ok(Some(task)) => sub_tasks.push(Arc::new(task)),
                Ok(None) => tracing::warn!(path = %sidecar.display(), "sub-task sidecar missing, dropping"),
                Err(err) => tracing::warn!(%err, path = %sidecar.display(), "failed to load sub-task sidecar"),
            }
        }

        Ok(Some(FolderAggregator {
            id: state.id,
            created_at: state.created_at,
            inner: Mutex::new(Inner {
                folder_id: state.folder_id,
                name: state.name,
                download_dir: state.download_dir,
                status: state.status,
                total_size: state.total_size,
                downloaded_size: state.downloaded_size,
                speed: state.speed,
                speed_limit_kbps: state.speed_limit_kbps,
                error_message: state.error_message,
                scanned: state.scanned,
                sub_tasks,
            }),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            max_concurrent_files: state.max_concurrent_files.max(1),
            num_connections_per_file: state.num_connections_per_file.max(1),
            retry_policy,
        }))
    }

    pub async fn start(self: Arc<Self>, provider: Arc<dyn MetadataProvider>) -> Result<()> {
        self.set_status(TaskStatus::Downloading);

        let already_scanned = self.inner.lock().unwrap().scanned;
        if !already_scanned {
            self.scan_and_build(&provider).await?;
            self.save_state()?;
        }

        let (sub_tasks, speed_limit) = {
            let inner = self.inner.lock().unwrap();
            (inner.sub_tasks.clone(), inner.speed_limit_kbps)
        };
        for task in &sub_tasks {
            if speed_limit != task.speed_limit_kbps() {
                task.set_speed_limit(speed_limit);
            }
        }

        let progress_task = tokio::spawn(Self::progress_monitor(Arc::clone(&self)));

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_files));
        let mut join_set = tokio::task::JoinSet::new();
        for task in sub_tasks {
            let semaphore = Arc::clone(&semaphore);
            let cancel = Arc::clone(&self.cancel_flag);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("folder semaphore never closed");
                if cancel.load(Ordering::SeqCst) {
                    return Ok(());
                }
                task.start().await
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
                    for task in self.inner.lock().unwrap().sub_tasks.iter() {
                        task.cancel();
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!(join_err));
                    }
                }
            }
        }

        progress_task.abort();
        self.refresh_aggregate_progress();

        if let Some(err) = first_error {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.status != TaskStatus::Canceled {
                    inner.status = TaskStatus::Error;
                    inner.error_message = Some(err.to_string());
                }
            }
            self.save_state()?;
            return Err(err);
        }

        if self.status() == TaskStatus::Canceled {
            self.save_state()?;
            return Ok(());
        }

        self.set_status(TaskStatus::Completed);
        self.save_state()?;
        Ok(())
    }

    async fn scan_and_build(&self, provider: &Arc<dyn MetadataProvider>) -> Result<()> {
        let (folder_id, base_dir) = {
            let inner = self.inner.lock().unwrap();
            (inner.folder_id.clone(), inner.download_dir.clone())
        };

        let entries = scan_recursive(provider.as_ref(), &folder_id, PathBuf::new()).await?;
        let headers = provider.auth_headers().await?;

        let mut sub_tasks = Vec::with_capacity(entries.len());
        let mut total_size = 0u64;
        for (index, entry) in entries.iter().enumerate() {
            let metadata = provider.metadata(&entry.file_id).await?;
            let dir = base_dir.join(entry.relative_path.parent().unwrap_or(std::path::Path::new("")));
            std::fs::create_dir_all(&dir)?;
            let filename = sanitize_entry_name(
                entry
                    .relative_path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("untitled"),
            );
            total_size += entry.size;
            let sub_id = TaskId(self.id.0 * 1_000_000 + index as i64);
            sub_tasks.push(Arc::new(SegmentedDownload::new(
                sub_id,
                self.created_at,
                metadata.web_content_link,
                filename,
                dir,
                headers.clone(),
                self.num_connections_per_file,
                false,
                self.inner.lock().unwrap().speed_limit_kbps,
                self.retry_policy,
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.total_size = total_size;
        inner.sub_tasks = sub_tasks;
        inner.scanned = true;
        Ok(())
    }

    async fn progress_monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            if self.status().is_terminal() {
                return;
            }
            self.refresh_aggregate_progress();
        }
    }

    fn refresh_aggregate_progress(&self) {
        let sub_tasks = self.inner.lock().unwrap().sub_tasks.clone();
        let mut downloaded = 0u64;
        let mut speed = 0.0;
        for task in &sub_tasks {
            let snap = task.snapshot();
            downloaded += snap.downloaded_size;
            speed += snap.speed;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.downloaded_size = downloaded;
        inner.speed = speed;
    }
}

/// Walks a remote folder tree, paginating each level via `list`.
async fn scan_recursive(
    provider: &dyn MetadataProvider,
    folder_id: &str,
    relative_prefix: PathBuf,
) -> Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let page = provider.list(folder_id, page_token.as_deref()).await?;
        for entry in page.files {
            let rel = relative_prefix.join(sanitize_entry_name(&entry.name));
            if entry.is_folder() {
                let nested = Box::pin(scan_recursive(provider, &entry.id, rel)).await?;
                out.extend(nested);
            } else {
                out.push(FileEntry {
                    relative_path: rel,
                    file_id: entry.id,
                    size: entry.size,
                });
            }
        }
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_entry_name_drops_unsafe_chars() {
        assert_eq!(sanitize_entry_name("report/final:v2.pdf"), "reportfinalv2.pdf");
        assert_eq!(sanitize_entry_name("  "), "untitled");
        assert_eq!(sanitize_entry_name("ok (copy).zip"), "ok (copy).zip");
    }

    #[test]
    fn new_folder_starts_pending_with_no_sub_tasks() {
        let folder = FolderAggregator::new(
            TaskId(1),
            0,
            "root".to_string(),
            "My Folder".to_string(),
            PathBuf::from("/tmp/ddm-test-folder"),
            DEFAULT_MAX_CONCURRENT_FILES,
            4,
            0,
            RetryPolicy::default(),
        );
        assert_eq!(folder.status(), TaskStatus::Pending);
        assert!(folder.sub_tasks().is_empty());
    }
}
