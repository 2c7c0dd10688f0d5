//! Capture sequencing: hold the shaft, then for every tooth move, wait for
//! `DONE`, capture and hand the file to the upload set.
//!
//! A run owns the motion link from start to finish. The health supervisor is
//! suspended first (so no `P` can reach the wire mid-run) and resumed on every
//! exit path when the guards drop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Local;
use uuid::Uuid;

use super::{CaptureTask, InspectionRun, OrchestratorError, Result, UploadSet, TEMP_DIR_PREFIX};
use crate::camera::Camera;
use crate::device::HealthSupervisor;
use crate::events::{InspectionEvent, UploadProgress};
use crate::serial::{MotionProtocol, ProtocolError};
use crate::stop::StopSignal;

/// What a finished capture loop leaves behind. Uploads may still be running.
pub struct RunOutput {
    pub output_dir: PathBuf,
    pub captures: Vec<PathBuf>,
    pub uploads: UploadSet,
    temporary: bool,
}

impl RunOutput {
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Wait (bounded) for outstanding uploads, then remove a temporary run
    /// directory if nothing was left in it.
    pub async fn finish(mut self, limit: Duration) -> UploadProgress {
        let settled = self.uploads.drain(limit).await;
        if settled && self.temporary {
            match tokio::fs::remove_dir(&self.output_dir).await {
                Ok(()) => log::debug!("Removed {}", self.output_dir.display()),
                Err(e) => log::debug!(
                    "Keeping {} ({}); failed uploads stay on disk",
                    self.output_dir.display(),
                    e
                ),
            }
        }
        self.uploads.progress()
    }
}

struct CapturingGuard<'a>(&'a AtomicBool);

impl Drop for CapturingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    supervisor: Arc<HealthSupervisor>,
    capturing: AtomicBool,
    /// Uploads started by runs that later aborted
    aborted_uploads: StdMutex<Vec<UploadSet>>,
}

impl Orchestrator {
    pub fn new(supervisor: Arc<HealthSupervisor>) -> Self {
        Self {
            supervisor,
            capturing: AtomicBool::new(false),
            aborted_uploads: StdMutex::new(Vec::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        &self.supervisor
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Checks that need no hardware traffic
    pub fn preflight(&self, run: &InspectionRun) -> Result<()> {
        run.validate()?;
        if self.is_capturing() {
            return Err(OrchestratorError::RunInProgress);
        }
        if !self.supervisor.manager().state().is_connected() {
            return Err(OrchestratorError::NotConnected);
        }
        Ok(())
    }

    /// Wait (bounded) for the uploads of aborted runs to settle.
    ///
    /// Captures taken before an abort still belong to their observation, so
    /// their uploads keep running after `run` returns an error. Returns true
    /// if all of them finished within `limit`.
    pub async fn drain_aborted_uploads(&self, limit: Duration) -> bool {
        let sets = std::mem::take(&mut *self.lock_aborted());
        if sets.is_empty() {
            return true;
        }

        let deadline = tokio::time::Instant::now() + limit;
        let mut settled = true;
        for mut uploads in sets {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            settled &= uploads.drain(left).await;
        }
        settled
    }

    fn lock_aborted(&self) -> std::sync::MutexGuard<'_, Vec<UploadSet>> {
        match self.aborted_uploads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn claim(&self) -> Result<CapturingGuard<'_>> {
        self.capturing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| OrchestratorError::RunInProgress)?;
        Ok(CapturingGuard(&self.capturing))
    }

    /// Execute one inspection run.
    ///
    /// Returns once every capture is on disk; uploads continue in the
    /// returned [`UploadSet`]. Any motion, link or camera failure aborts the
    /// run at that index and leaves the motor where it is.
    pub async fn run<C, F>(
        &self,
        run: &InspectionRun,
        camera: &mut C,
        stop: &StopSignal,
        mut on_capture: F,
    ) -> Result<RunOutput>
    where
        C: Camera + ?Sized,
        F: FnMut(&Path),
    {
        self.preflight(run)?;
        let _capturing = self.claim()?;

        let manager = self.supervisor.manager();
        let events = manager.events().clone();

        let (output_dir, temporary) = resolve_output_dir(run);
        tokio::fs::create_dir_all(&output_dir).await?;
        log::info!(
            "Starting run: {} captures of {} teeth into {}",
            run.capture_count,
            run.tooth_count,
            output_dir.display()
        );

        let paused = self.supervisor.suspend().await;
        let mut slot = manager.lock_link().await;
        let Some(protocol) = slot.as_mut() else {
            return Err(OrchestratorError::NotConnected);
        };

        if let Err(e) = protocol.hold().await {
            manager.drop_link(&mut slot, &format!("hold failed: {}", e));
            return Err(OrchestratorError::Link(e));
        }

        events.emit(InspectionEvent::RunStarted {
            output_dir: output_dir.clone(),
            teeth: run.tooth_count,
            captures: run.capture_count,
        });

        let mut uploads = UploadSet::new(
            run.upload_target.clone(),
            run.cleanup_on_upload_success,
            run.max_concurrent_uploads,
            run.capture_count,
            events.clone(),
        );
        let mut captures = Vec::with_capacity(run.capture_count as usize);
        let mut failure = None;

        for index in 0..run.capture_count {
            let task = CaptureTask::new(index, run.tooth_count, &output_dir);
            if let Err(e) = capture_one(protocol, camera, &task, run.done_timeout, stop).await {
                failure = Some((index, e));
                break;
            }

            log::info!(
                "Captured tooth {} at {:.3} deg",
                task.tooth_number,
                task.target_angle_deg
            );
            events.emit(InspectionEvent::CaptureSaved {
                tooth_number: task.tooth_number,
                path: task.file_path.clone(),
            });
            on_capture(&task.file_path);
            uploads.dispatch(task.file_path.clone(), task.tooth_number);
            events.emit(InspectionEvent::Progress {
                index,
                total: run.capture_count,
                angle_deg: task.target_angle_deg,
            });
            captures.push(task.file_path);
        }

        if let Some((index, error)) = failure {
            if matches!(error, OrchestratorError::LinkLost { .. }) {
                manager.drop_link(&mut slot, &format!("lost during capture {}", index));
            }
            log::error!("Run aborted at capture {}: {}", index, error);
            events.emit(InspectionEvent::RunAborted {
                index,
                reason: error.to_string(),
            });
            if uploads.in_flight() > 0 {
                self.lock_aborted().push(uploads);
            }
            return Err(error);
        }

        drop(slot);
        drop(paused);

        log::info!("Run finished: {} captures", captures.len());
        events.emit(InspectionEvent::RunFinished {
            output_dir: output_dir.clone(),
            captures: captures.len() as u32,
        });

        Ok(RunOutput {
            output_dir,
            captures,
            uploads,
            temporary,
        })
    }
}

async fn capture_one<C>(
    protocol: &mut MotionProtocol,
    camera: &mut C,
    task: &CaptureTask,
    done_timeout: Duration,
    stop: &StopSignal,
) -> Result<()>
where
    C: Camera + ?Sized,
{
    let index = task.index;
    if stop.is_set() {
        return Err(OrchestratorError::MotionTimeout {
            index,
            cause: ProtocolError::Cancelled,
        });
    }

    log::debug!("Capture {}: moving to {:.6} deg", index, task.target_angle_deg);
    match protocol
        .move_to(task.target_angle_deg, done_timeout, Some(stop))
        .await
    {
        Ok(()) => {}
        Err(ProtocolError::LinkClosed) => return Err(OrchestratorError::LinkLost { index }),
        Err(cause) => return Err(OrchestratorError::MotionTimeout { index, cause }),
    }

    camera
        .capture_to(&task.file_path)
        .await
        .map_err(|source| OrchestratorError::Camera { index, source })
}

/// Upload runs write to a fresh `inspection_<uuid>` directory so leftovers
/// can be swept later; local runs optionally get a timestamped subfolder.
fn resolve_output_dir(run: &InspectionRun) -> (PathBuf, bool) {
    if run.upload_target.is_some() {
        let name = format!("{}{}", TEMP_DIR_PREFIX, Uuid::new_v4().simple());
        return (run.output_root.join(name), true);
    }
    if run.make_timestamped_subfolder {
        let name = format!("run_{}", Local::now().format("%Y%m%d_%H%M%S"));
        return (run.output_root.join(name), false);
    }
    (run.output_root.clone(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunSettings;

    #[test]
    fn local_runs_get_a_timestamped_subfolder() {
        let mut settings = RunSettings::default();
        settings.output_root = PathBuf::from("captures");

        let (dir, temporary) = resolve_output_dir(&InspectionRun::new(10, 10, &settings));
        assert!(!temporary);
        assert_eq!(dir.parent(), Some(Path::new("captures")));
        assert!(dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("run_") && n.len() == "run_20240101_120000".len()));

        settings.make_timestamped_subfolder = false;
        let (dir, _) = resolve_output_dir(&InspectionRun::new(10, 10, &settings));
        assert_eq!(dir, PathBuf::from("captures"));
    }
}
