//! Background uploads for one run.
//!
//! Each capture is handed off as soon as it is on disk. Uploads run
//! concurrently (bounded by a semaphore) and never block the capture loop;
//! the run returns while they are still in flight. Every upload is attempted
//! once. On failure the file stays on disk; on success it is removed when
//! cleanup is enabled.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::UploadTarget;
use crate::events::{EventSender, InspectionEvent, UploadOutcome, UploadProgress};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadJob {
    pub observation_id: u64,
    pub file_path: PathBuf,
    /// 1-based tooth number
    pub tag: u32,
}

pub struct UploadSet {
    target: Option<UploadTarget>,
    cleanup_on_success: bool,
    permits: Arc<Semaphore>,
    progress: Arc<StdMutex<UploadProgress>>,
    events: EventSender,
    handles: Vec<JoinHandle<()>>,
}

impl UploadSet {
    pub(crate) fn new(
        target: Option<UploadTarget>,
        cleanup_on_success: bool,
        max_concurrent: usize,
        capture_count: u32,
        events: EventSender,
    ) -> Self {
        // The observation already exists by the time a run with a target starts
        let progress = match target {
            Some(_) => UploadProgress {
                total_steps: 1 + capture_count,
                completed_steps: 1,
                ..Default::default()
            },
            None => UploadProgress::default(),
        };

        Self {
            target,
            cleanup_on_success,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            progress: Arc::new(StdMutex::new(progress)),
            events,
            handles: Vec::new(),
        }
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// Start uploading `file_path` in the background. Returns false when the
    /// run has no upload target.
    pub fn dispatch(&mut self, file_path: PathBuf, tag: u32) -> bool {
        let Some(target) = &self.target else {
            return false;
        };

        let job = UploadJob {
            observation_id: target.observation_id,
            file_path,
            tag,
        };
        let worker = UploadWorker {
            target: target.clone(),
            cleanup_on_success: self.cleanup_on_success,
            permits: Arc::clone(&self.permits),
            progress: Arc::clone(&self.progress),
            events: self.events.clone(),
        };

        self.handles.retain(|h| !h.is_finished());
        self.handles.push(tokio::spawn(worker.run(job)));
        true
    }

    pub fn progress(&self) -> UploadProgress {
        lock_progress(&self.progress)
    }

    pub fn in_flight(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every dispatched upload to settle, up to `limit`.
    ///
    /// Returns true if all uploads finished in time. Uploads still running at
    /// the deadline keep going in the background.
    pub async fn drain(&mut self, limit: Duration) -> bool {
        let handles = std::mem::take(&mut self.handles);
        if handles.is_empty() {
            return true;
        }

        let count = handles.len();
        match tokio::time::timeout(limit, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        log::error!("Upload task panicked: {}", e);
                    }
                }
                log::info!("All {} uploads settled", count);
                true
            }
            Err(_) => {
                log::warn!("Uploads still in flight after {:?}", limit);
                false
            }
        }
    }
}

fn lock_progress(progress: &StdMutex<UploadProgress>) -> UploadProgress {
    match progress.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

struct UploadWorker {
    target: UploadTarget,
    cleanup_on_success: bool,
    permits: Arc<Semaphore>,
    progress: Arc<StdMutex<UploadProgress>>,
    events: EventSender,
}

impl UploadWorker {
    async fn run(self, job: UploadJob) {
        let _permit = self.permits.acquire_owned().await.ok();

        let outcome = match self
            .target
            .api
            .upload_attachment(job.observation_id, &job.file_path, job.tag)
            .await
        {
            Ok(meta) => {
                log::info!(
                    "Uploaded tooth {} as attachment {:?}",
                    job.tag,
                    meta.id
                );
                let file_removed = self.cleanup_on_success && remove_capture(&job).await;
                UploadOutcome::Uploaded {
                    attachment_id: meta.id,
                    file_removed,
                }
            }
            Err(e) => {
                log::warn!(
                    "Upload of tooth {} failed, keeping {}: {}",
                    job.tag,
                    job.file_path.display(),
                    e
                );
                UploadOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let progress = {
            let mut guard = match self.progress.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match outcome {
                UploadOutcome::Uploaded { .. } => guard.uploaded += 1,
                UploadOutcome::Failed { .. } => guard.failed += 1,
            }
            guard.completed_steps += 1;
            *guard
        };

        self.events.emit(InspectionEvent::UploadResult {
            tooth_number: job.tag,
            path: job.file_path,
            outcome,
            progress,
        });
    }
}

async fn remove_capture(job: &UploadJob) -> bool {
    match tokio::fs::remove_file(&job.file_path).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Could not remove {}: {}", job.file_path.display(), e);
            false
        }
    }
}
