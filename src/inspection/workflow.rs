//! Database-backed inspection: create the observation, run the capture
//! sequence into a temporary directory and upload every image against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;

use super::{InspectionRun, Orchestrator, OrchestratorError, RunOutput, UploadTarget, TEMP_DIR_PREFIX};
use crate::api::{
    extract_cut_number, extract_teeth_from_context, extract_test_case_id, ApiError, ApiResult,
    InspectionApi, ObservationScope,
};
use crate::camera::Camera;
use crate::config::RunSettings;
use crate::stop::StopSignal;

/// Directories younger than this may belong to a run that is still uploading.
const MIN_TEMP_DIR_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Could not create observation: {0}")]
    Observation(#[source] ApiError),

    #[error(transparent)]
    Run(#[from] OrchestratorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRunRequest {
    pub test_case_id: u64,
    /// `None` or `Some(0)` records an incoming inspection
    pub cut_number: Option<u32>,
    pub tooth_count: u32,
}

impl ApiRunRequest {
    /// Read the test case and tooth count out of a sample context document
    pub fn from_context(ctx: &Value) -> ApiResult<Self> {
        Ok(Self {
            test_case_id: extract_test_case_id(ctx)?,
            cut_number: extract_cut_number(ctx),
            tooth_count: extract_teeth_from_context(ctx)?,
        })
    }
}

/// Create the observation, then capture every tooth and upload each image
/// tagged with its tooth number.
///
/// Nothing moves if the observation cannot be created. Captures go to
/// `<temp>/inspection_<uuid>`.
#[allow(clippy::too_many_arguments)]
pub async fn run_with_api<C, F>(
    orchestrator: &Orchestrator,
    api: Arc<dyn InspectionApi>,
    request: &ApiRunRequest,
    settings: &RunSettings,
    temp_root: &Path,
    camera: &mut C,
    stop: &StopSignal,
    on_capture: F,
) -> Result<RunOutput, WorkflowError>
where
    C: Camera + ?Sized,
    F: FnMut(&Path),
{
    let run = InspectionRun::new(request.tooth_count, request.tooth_count, settings)
        .with_output_root(temp_root);
    // Refuse before creating a record we could never fill
    orchestrator.preflight(&run)?;

    log::info!(
        "Creating {} observation for test case {}",
        ObservationScope::for_cut(request.cut_number).as_str(),
        request.test_case_id
    );
    let observation = api
        .create_observation(request.test_case_id, request.cut_number)
        .await
        .map_err(WorkflowError::Observation)?;
    log::info!("Observation {} created", observation.id);

    let run = run.with_upload_target(UploadTarget {
        observation_id: observation.id,
        api,
    });
    Ok(orchestrator.run(&run, camera, stop, on_capture).await?)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub skipped_recent: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Remove `inspection_*` directories under the system temp dir that are
/// older than `max_age`.
pub fn cleanup_old_temp_dirs(max_age: Duration) -> CleanupReport {
    cleanup_temp_dirs_in(&std::env::temp_dir(), max_age, SystemTime::now())
}

/// Sweep `root` for stale run directories as of `now`.
///
/// Anything modified in the last five minutes is skipped regardless of
/// `max_age` since an upload may still be reading from it.
pub fn cleanup_temp_dirs_in(root: &Path, max_age: Duration, now: SystemTime) -> CleanupReport {
    let mut report = CleanupReport::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot scan {}: {}", root.display(), e);
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_run_dir = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TEMP_DIR_PREFIX));
        if !is_run_dir || !path.is_dir() {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();

        if age < MIN_TEMP_DIR_AGE || age < max_age {
            report.skipped_recent += 1;
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                log::info!("Removed stale run directory {}", path.display());
                report.deleted.push(path);
            }
            Err(e) => {
                log::warn!("Failed to remove {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_from_sample_context() {
        let ctx = serde_json::json!({
            "sample": { "design": { "attribute_values": { "Number of Teeth": 36 } } },
            "test_case": { "id": 41, "cut_number": 0 }
        });
        let request = ApiRunRequest::from_context(&ctx).unwrap();
        assert_eq!(
            request,
            ApiRunRequest {
                test_case_id: 41,
                cut_number: Some(0),
                tooth_count: 36,
            }
        );
        assert_eq!(ObservationScope::for_cut(request.cut_number), ObservationScope::Incoming);
    }

    #[test]
    fn sweeps_only_old_run_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("inspection_old")).unwrap();
        std::fs::write(root.path().join("inspection_old/tooth_0001.png"), b"x").unwrap();
        std::fs::create_dir(root.path().join("unrelated")).unwrap();
        std::fs::write(root.path().join("inspection_file"), b"not a dir").unwrap();

        let later = SystemTime::now() + Duration::from_secs(48 * 3600);
        let report = cleanup_temp_dirs_in(root.path(), Duration::from_secs(24 * 3600), later);

        assert_eq!(report.deleted, vec![root.path().join("inspection_old")]);
        assert!(report.failed.is_empty());
        assert!(root.path().join("unrelated").exists());
        assert!(root.path().join("inspection_file").exists());
    }

    #[test]
    fn recent_directories_survive_a_zero_max_age() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("inspection_live")).unwrap();

        let report = cleanup_temp_dirs_in(root.path(), Duration::ZERO, SystemTime::now());

        assert!(report.deleted.is_empty());
        assert_eq!(report.skipped_recent, 1);
        assert!(root.path().join("inspection_live").exists());
    }
}
