//! `Scheduler`: global admission control and post-completion hooks.
//!
//! A single `process_queue()` pass admits earliest-created PENDING/QUEUED
//! tasks up to `max_concurrent_downloads`, counting a FolderAggregator as
//! one unit against the ceiling regardless of its own internal fan-out.

use crate::config::DdmConfig;
use crate::extractor::{has_supported_extension, Extractor};
use crate::part;
use crate::provider::MetadataProvider;
use crate::registry::{Task, TaskRegistry};
use crate::task::{SegmentedDownload, TaskStatus};

use std::sync::Arc;

/// Category subfolder for `organize_files`, keyed by extension.
fn category_for(filename: &str) -> &'static str {
    const IMAGES: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".webp"];
    const VIDEOS: &[&str] = &[".mp4", ".mkv", ".avi", ".mov", ".webm", ".flv"];
    const MUSIC: &[&str] = &[".mp3", ".wav", ".flac", ".ogg", ".m4a", ".aac"];
    const ARCHIVES: &[&str] = &[".zip", ".tar", ".gz", ".tgz", ".7z", ".rar"];
    const PROGRAMS: &[&str] = &[".exe", ".msi", ".deb", ".rpm", ".appimage"];
    const DOCUMENTS: &[&str] = &[
        ".pdf", ".doc", ".docx", ".txt", ".md", ".odt", ".xls", ".xlsx", ".ppt", ".pptx",
    ];

    let lower = filename.to_ascii_lowercase();
    let matches = |exts: &[&str]| exts.iter().any(|e| lower.ends_with(e));

    if matches(IMAGES) {
        "Images"
    } else if matches(VIDEOS) {
        "Videos"
    } else if matches(MUSIC) {
        "Music"
    } else if matches(ARCHIVES) {
        "Archives"
    } else if matches(PROGRAMS) {
        "Programs"
    } else if matches(DOCUMENTS) {
        "Documents"
    } else {
        "Others"
    }
}

pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    extractor: Arc<dyn Extractor>,
    provider: Option<Arc<dyn MetadataProvider>>,
    config: DdmConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        extractor: Arc<dyn Extractor>,
        provider: Option<Arc<dyn MetadataProvider>>,
        config: DdmConfig,
    ) -> Self {
        Scheduler {
            registry,
            extractor,
            provider,
            config,
        }
    }

    /// Invoked after every mutation that could change admission: add,
    /// resume, task completion, or a `max_concurrent_downloads` change.
    ///
    /// 1. Count tasks DOWNLOADING (A).
    /// 2. While A < ceiling and some task is PENDING/QUEUED: admit the
    ///    earliest-created such task.
    /// 3. Remaining PENDING tasks are demoted to QUEUED.
    pub fn process_queue(self: &Arc<Self>) {
        let mut tasks = self.registry.list();
        tasks.sort_by_key(|t| t.created_at());

        let mut active = tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Downloading)
            .count();

        for task in &tasks {
            if active >= self.config.max_concurrent_downloads {
                break;
            }
            if matches!(task.status(), TaskStatus::Pending | TaskStatus::Queued) {
                self.admit(task.clone());
                active += 1;
            }
        }

        for task in &tasks {
            if task.status() == TaskStatus::Pending {
                task.set_queued();
            }
        }
    }

    fn admit(self: &Arc<Self>, task: Task) {
        task.set_downloading();
        let scheduler = Arc::clone(self);
        match task {
            Task::File(t) => {
                tokio::spawn(async move {
                    let result = t.clone().start().await;
                    if result.is_ok() {
                        scheduler.run_post_completion(&t).await;
                    }
                    scheduler.process_queue();
                });
            }
            Task::Folder(f) => {
                let provider = scheduler.provider.clone();
                tokio::spawn(async move {
                    match provider {
                        Some(provider) => {
                            if let Err(err) = f.clone().start(provider).await {
                                tracing::warn!(%err, "folder task ended in error");
                            }
                        }
                        None => {
                            tracing::error!(
                                "folder task admitted with no MetadataProvider configured"
                            );
                            f.cancel();
                        }
                    }
                    scheduler.process_queue();
                });
            }
        }
    }

    async fn run_post_completion(&self, task: &Arc<SegmentedDownload>) {
        let snap = task.snapshot();

        if self.config.organize_files {
            if let Err(err) = self.organize(task, &snap.filename) {
                tracing::warn!(%err, "organize_files move failed");
            }
        }

        if snap.auto_extract {
            self.extract(task).await;
        }
    }

    /// Moves the finished file into a category subfolder keyed by
    /// extension. Reuses `rename`'s state/part-file bookkeeping rather than
    /// moving the final file by hand.
    fn organize(&self, task: &Arc<SegmentedDownload>, filename: &str) -> anyhow::Result<()> {
        let category = category_for(filename);
        let download_dir = task.snapshot().download_dir;
        // `rename` moves the state sidecar alongside the final file, so the
        // mirrored `.parts/<category>` directory needs to exist too.
        std::fs::create_dir_all(download_dir.join(category))?;
        std::fs::create_dir_all(part::parts_dir(&download_dir).join(category))?;
        task.rename(&format!("{category}/{filename}"))
    }

    async fn extract(&self, task: &Arc<SegmentedDownload>) {
        let filename = task.snapshot().filename;
        if !has_supported_extension(&filename) {
            task.mark_extraction_skipped();
            return;
        }
        if task.begin_extraction().is_err() {
            return;
        }

        let path = task.final_filepath();
        let extractor = Arc::clone(&self.extractor);
        let outcome = tokio::task::spawn_blocking(move || extractor.extract(&path)).await;
        match outcome {
            Ok(Ok((success, message))) => {
                if !success {
                    tracing::info!(%message, "extraction declined by collaborator");
                }
                task.finish_extraction(Ok(success));
            }
            Ok(Err(err)) => task.finish_extraction(Err(err.to_string())),
            Err(join_err) => task.finish_extraction(Err(join_err.to_string())),
        }
    }
}
