//! `TaskRegistry`: in-memory task map with on-disk startup recovery.
//!
//! There is no central database here. Each task owns its own JSON
//! sidecar, and this registry discovers them by walking
//! `<root>/.parts/*.state.json` at startup and dispatching on the
//! `"type"` field.

use crate::folder::FolderAggregator;
use crate::part;
use crate::retry::RetryPolicy;
use crate::task::{SegmentedDownload, TaskId, TaskStatus};
use crate::url_model::derive_filename;

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Either kind of task the registry tracks.
#[derive(Clone)]
pub enum Task {
    File(Arc<SegmentedDownload>),
    Folder(Arc<FolderAggregator>),
}

impl Task {
    pub fn id(&self) -> TaskId {
        match self {
            Task::File(t) => t.id,
            Task::Folder(f) => f.id,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Task::File(t) => t.status(),
            Task::Folder(f) => f.status(),
        }
    }

    pub fn pause(&self) {
        match self {
            Task::File(t) => t.pause(),
            Task::Folder(f) => f.pause(),
        }
    }

    pub fn resume(&self) {
        match self {
            Task::File(t) => t.resume(),
            Task::Folder(f) => f.resume(),
        }
    }

    pub fn cancel(&self) {
        match self {
            Task::File(t) => t.cancel(),
            Task::Folder(f) => f.cancel(),
        }
    }

    pub fn set_downloading(&self) {
        match self {
            Task::File(t) => t.set_downloading(),
            Task::Folder(f) => f.set_downloading(),
        }
    }

    pub fn set_queued(&self) {
        match self {
            Task::File(t) => t.set_queued(),
            Task::Folder(f) => f.set_queued(),
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            Task::File(t) => t.created_at,
            Task::Folder(f) => f.created_at,
        }
    }

    pub fn set_speed_limit(&self, kbps: u32) {
        match self {
            Task::File(t) => t.set_speed_limit(kbps),
            Task::Folder(f) => f.set_speed_limit(kbps),
        }
    }

    /// Rejected while DOWNLOADING. Applies uniformly to single-file and
    /// folder aggregates alike.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        match self {
            Task::File(t) => t.rename(new_name),
            Task::Folder(f) => f.rename(new_name),
        }
    }

    pub fn delete_files(&self) -> Result<()> {
        match self {
            Task::File(t) => t.delete_files(),
            Task::Folder(f) => f.delete_files(),
        }
    }
}

/// Generates ids from milliseconds since epoch, matching the Python
/// reference's `str(int(time.time() * 1000))`. A monotonic counter breaks
/// ties when two tasks are created within the same millisecond.
struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    fn new() -> Self {
        IdGenerator {
            last: AtomicI64::new(0),
        }
    }

    fn next(&self) -> TaskId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        loop {
            let prev = self.last.load(Ordering::SeqCst);
            let candidate = now.max(prev + 1);
            if self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return TaskId(candidate);
            }
        }
    }
}

pub struct TaskRegistry {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    ids: IdGenerator,
    default_retry_policy: RetryPolicy,
}

impl TaskRegistry {
    pub fn new(default_retry_policy: RetryPolicy) -> Self {
        TaskRegistry {
            tasks: Mutex::new(BTreeMap::new()),
            ids: IdGenerator::new(),
            default_retry_policy,
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// Tasks in creation order (their ids are monotonically increasing).
    pub fn list(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    pub fn delete(&self, id: TaskId, remove_files: bool) -> Result<()> {
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.remove(&id)
        };
        if let Some(task) = task {
            task.cancel();
            if remove_files {
                task.delete_files()?;
            }
        }
        Ok(())
    }

    pub fn rename(&self, id: TaskId, new_name: &str) -> Result<()> {
        let task = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no such task: {:?}", id))?;
        task.rename(new_name)
    }

    /// Registers a new single-URL download. `filename_hint` overrides the
    /// name derived from the URL/Content-Disposition when present.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &self,
        url: String,
        filename_hint: Option<String>,
        download_dir: PathBuf,
        headers: HashMap<String, String>,
        num_connections: usize,
        auto_extract: bool,
        speed_limit_kbps: u32,
    ) -> Arc<SegmentedDownload> {
        let desired = filename_hint.unwrap_or_else(|| derive_filename(&url, None));
        let filename = self.unique_filename(&download_dir, &desired);
        let id = self.ids.next();
        let created_at = id.0;
        let task = Arc::new(SegmentedDownload::new(
            id,
            created_at,
            url,
            filename,
            download_dir,
            headers,
            num_connections,
            auto_extract,
            speed_limit_kbps,
            self.default_retry_policy,
        ));
        self.tasks
            .lock()
            .unwrap()
            .insert(id, Task::File(Arc::clone(&task)));
        task
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_folder(
        &self,
        folder_id: String,
        name: String,
        download_dir: PathBuf,
        max_concurrent_files: usize,
        num_connections_per_file: usize,
        speed_limit_kbps: u32,
    ) -> Arc<FolderAggregator> {
        let id = self.ids.next();
        let created_at = id.0;
        let task = Arc::new(FolderAggregator::new(
            id,
            created_at,
            folder_id,
            name,
            download_dir,
            max_concurrent_files,
            num_connections_per_file,
            speed_limit_kbps,
            self.default_retry_policy,
        ));
        self.tasks
            .lock()
            .unwrap()
            .insert(id, Task::Folder(Arc::clone(&task)));
        task
    }

    /// Appends " (k)" before the extension until `desired` is free, both
    /// on disk and among tasks already registered for `download_dir`.
    fn unique_filename(&self, download_dir: &Path, desired: &str) -> String {
        if !self.name_taken(download_dir, desired) {
            return desired.to_string();
        }
        let (stem, ext) = split_extension(desired);
        for k in 1..10_000 {
            let candidate = match &ext {
                Some(ext) => format!("{stem} ({k}).{ext}"),
                None => format!("{stem} ({k})"),
            };
            if !self.name_taken(download_dir, &candidate) {
                return candidate;
            }
        }
        desired.to_string()
    }

    fn name_taken(&self, download_dir: &Path, filename: &str) -> bool {
        if download_dir.join(filename).exists()
            || part::state_path(download_dir, filename).exists()
        {
            return true;
        }
        self.tasks.lock().unwrap().values().any(|t| match t {
            Task::File(task) => {
                let snap = task.snapshot();
                snap.download_dir == download_dir && snap.filename == filename
            }
            Task::Folder(_) => false,
        })
    }

    /// Walks `<root>/.parts/*.state.json`, loading each sidecar and
    /// dispatching on its `"type"` field. A task found DOWNLOADING or
    /// EXTRACTING is demoted to PAUSED — a crash or kill -9 mid-transfer
    /// leaves no worker alive to resume it, so the engine must not present
    /// it as actively running.
    pub fn discover(&self, root: &Path) -> Result<usize> {
        let dir = part::parts_dir(root);
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".state.json"))
            {
                continue;
            }

            let kind = match sidecar_kind(&path) {
                Ok(k) => k,
                Err(err) => {
                    tracing::warn!(%err, path = %path.display(), "skipping unreadable sidecar");
                    continue;
                }
            };

            match kind.as_str() {
                "folder" => {
                    if let Some(task) = FolderAggregator::load_state(&path, self.default_retry_policy)? {
                        demote_if_running(&task.status(), |s| task.set_status_for_recovery(s));
                        self.tasks
                            .lock()
                            .unwrap()
                            .insert(task.id, Task::Folder(Arc::new(task)));
                        loaded += 1;
                    }
                }
                _ => {
                    if let Some(task) = SegmentedDownload::load_state(&path, self.default_retry_policy)? {
                        demote_if_running(&task.status(), |s| task.set_status_for_recovery(s));
                        self.tasks
                            .lock()
                            .unwrap()
                            .insert(task.id, Task::File(Arc::new(task)));
                        loaded += 1;
                    }
                }
            }
        }

        Ok(loaded)
    }
}

fn demote_if_running(status: &TaskStatus, apply: impl FnOnce(TaskStatus)) {
    if matches!(status, TaskStatus::Downloading | TaskStatus::Extracting) {
        apply(TaskStatus::Paused);
    }
}

fn sidecar_kind(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    let value: serde_json::Value = serde_json::from_slice(&data)?;
    Ok(value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("file")
        .to_string())
}

fn split_extension(filename: &str) -> (String, Option<String>) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (
            filename[..idx].to_string(),
            Some(filename[idx + 1..].to_string()),
        ),
        _ => (filename.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(RetryPolicy::default())
    }

    #[test]
    fn add_file_assigns_unique_ids() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let t1 = reg.add_file(
            "https://example.invalid/a.bin".to_string(),
            None,
            dir.path().to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
        );
        let t2 = reg.add_file(
            "https://example.invalid/b.bin".to_string(),
            None,
            dir.path().to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
        );
        assert_ne!(t1.id, t2.id);
        assert_eq!(reg.list().len(), 2);
    }

    #[test]
    fn add_file_dedupes_filename_collision() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let t1 = reg.add_file(
            "https://example.invalid/archive.zip".to_string(),
            None,
            dir.path().to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
        );
        let t2 = reg.add_file(
            "https://example.invalid/other/archive.zip".to_string(),
            None,
            dir.path().to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
        );
        assert_eq!(t1.snapshot().filename, "archive.zip");
        assert_eq!(t2.snapshot().filename, "archive (1).zip");
    }

    #[test]
    fn delete_removes_from_registry() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let t1 = reg.add_file(
            "https://example.invalid/a.bin".to_string(),
            None,
            dir.path().to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
        );
        let id = t1.id;
        reg.delete(id, false).unwrap();
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn discover_demotes_downloading_to_paused() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let t1 = reg.add_file(
            "https://example.invalid/a.bin".to_string(),
            None,
            dir.path().to_path_buf(),
            HashMap::new(),
            4,
            false,
            0,
        );
        t1.set_status_for_recovery(TaskStatus::Downloading);
        t1.save_state().unwrap();

        let reg2 = registry();
        let loaded = reg2.discover(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        let recovered = reg2.get(t1.id).unwrap();
        assert_eq!(recovered.status(), TaskStatus::Paused);
    }
}
