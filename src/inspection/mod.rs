pub mod runner;
pub mod uploads;
pub mod workflow;

pub use runner::{Orchestrator, RunOutput};
pub use uploads::{UploadJob, UploadSet};
pub use workflow::{
    cleanup_old_temp_dirs, cleanup_temp_dirs_in, run_with_api, ApiRunRequest, CleanupReport,
    WorkflowError,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::api::InspectionApi;
use crate::camera::CameraError;
use crate::config::RunSettings;
use crate::kinematics::target_angle_deg;
use crate::serial::{LinkError, ProtocolError};

pub const TEMP_DIR_PREFIX: &str = "inspection_";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Another run is still capturing")]
    RunInProgress,

    #[error("Motion link not connected")]
    NotConnected,

    #[error("Move for capture {index} did not complete: {cause}")]
    MotionTimeout { index: u32, cause: ProtocolError },

    #[error("Motion link lost during capture {index}")]
    LinkLost { index: u32 },

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Capture {index} failed: {source}")]
    Camera { index: u32, source: CameraError },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Where a run's captures get uploaded
#[derive(Clone)]
pub struct UploadTarget {
    pub observation_id: u64,
    pub api: Arc<dyn InspectionApi>,
}

impl std::fmt::Debug for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTarget")
            .field("observation_id", &self.observation_id)
            .finish_non_exhaustive()
    }
}

/// Parameters of one inspection run; fixed once the run starts.
#[derive(Debug, Clone)]
pub struct InspectionRun {
    pub tooth_count: u32,
    pub capture_count: u32,
    pub output_root: PathBuf,
    pub make_timestamped_subfolder: bool,
    pub upload_target: Option<UploadTarget>,
    pub cleanup_on_upload_success: bool,
    pub done_timeout: Duration,
    pub max_concurrent_uploads: usize,
}

impl InspectionRun {
    pub fn new(tooth_count: u32, capture_count: u32, settings: &RunSettings) -> Self {
        Self {
            tooth_count,
            capture_count,
            output_root: settings.output_root.clone(),
            make_timestamped_subfolder: settings.make_timestamped_subfolder,
            upload_target: None,
            cleanup_on_upload_success: settings.cleanup_on_upload_success,
            done_timeout: Duration::from_millis(settings.done_timeout_ms),
            max_concurrent_uploads: settings.max_concurrent_uploads,
        }
    }

    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    pub fn with_upload_target(mut self, target: UploadTarget) -> Self {
        self.upload_target = Some(target);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tooth_count == 0 {
            return Err(OrchestratorError::InvalidConfig("tooth count must be > 0".into()));
        }
        if self.capture_count == 0 {
            return Err(OrchestratorError::InvalidConfig("capture count must be >= 1".into()));
        }
        if self.capture_count > self.tooth_count {
            return Err(OrchestratorError::InvalidConfig(format!(
                "capture count {} exceeds tooth count {}",
                self.capture_count, self.tooth_count
            )));
        }
        if self.done_timeout.is_zero() {
            return Err(OrchestratorError::InvalidConfig("move timeout must be > 0".into()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(OrchestratorError::InvalidConfig("upload concurrency must be > 0".into()));
        }
        Ok(())
    }
}

/// One move + capture step
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureTask {
    pub index: u32,
    pub tooth_number: u32,
    pub target_angle_deg: f64,
    pub file_path: PathBuf,
}

impl CaptureTask {
    pub fn new(index: u32, tooth_count: u32, run_dir: &Path) -> Self {
        let tooth_number = index + 1;
        let target_angle_deg = target_angle_deg(index, tooth_count);
        Self {
            index,
            tooth_number,
            target_angle_deg,
            file_path: run_dir.join(capture_file_name(tooth_number, target_angle_deg)),
        }
    }
}

/// `tooth_<4-digit tooth number>_deg_<angle, 6 decimals>.png`
pub fn capture_file_name(tooth_number: u32, angle_deg: f64) -> String {
    format!("tooth_{:04}_deg_{:.6}.png", tooth_number, angle_deg)
}
