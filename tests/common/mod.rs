#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use gear_inspector_lib::api::{
    ApiError, ApiResult, AttachmentMeta, InspectionApi, Observation, ObservationScope,
};
use gear_inspector_lib::camera::{Camera, MockCamera, MockCameraHandle};
use gear_inspector_lib::config::{HealthSettings, RunSettings};
use gear_inspector_lib::device::{DeviceManager, HealthSupervisor, LinkState, MockConnector};
use gear_inspector_lib::events::{self, EventReceiver, InspectionEvent};
use gear_inspector_lib::inspection::{InspectionRun, Orchestrator};
use gear_inspector_lib::serial::mock::MockDeviceHandle;

pub const OBSERVATION_ID: u64 = 501;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpload {
    pub observation_id: u64,
    pub path: PathBuf,
    pub tag: u32,
    pub existed: bool,
}

/// In-memory inspection database that records every call.
#[derive(Default)]
pub struct RecordingApi {
    pub observations: Mutex<Vec<(u64, Option<u32>)>>,
    pub uploads: Mutex<Vec<RecordedUpload>>,
    pub fail_observation: bool,
    pub failing_tags: HashSet<u32>,
    pub upload_delay: Duration,
}

impl RecordingApi {
    pub fn uploaded_tags(&self) -> Vec<u32> {
        let mut tags: Vec<u32> = self.uploads.lock().unwrap().iter().map(|u| u.tag).collect();
        tags.sort_unstable();
        tags
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.lock().unwrap().len()
    }
}

#[async_trait]
impl InspectionApi for RecordingApi {
    async fn sample_context(&self, identifier: &str) -> ApiResult<Value> {
        Ok(json!({
            "sample": { "identifier": identifier, "design": { "attribute_values": { "Number of Teeth": 6 } } },
            "test_case": { "id": 9, "cut_number": 2 }
        }))
    }

    async fn create_observation(
        &self,
        test_case_id: u64,
        cut_number: Option<u32>,
    ) -> ApiResult<Observation> {
        self.observations.lock().unwrap().push((test_case_id, cut_number));
        if self.fail_observation {
            return Err(ApiError::Status {
                status: 500,
                body: "database unavailable".to_string(),
            });
        }
        Ok(Observation {
            id: OBSERVATION_ID,
            test_case_id,
            scope: ObservationScope::for_cut(cut_number),
            cut_number,
        })
    }

    async fn upload_attachment(
        &self,
        observation_id: u64,
        path: &Path,
        tag: u32,
    ) -> ApiResult<AttachmentMeta> {
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        self.uploads.lock().unwrap().push(RecordedUpload {
            observation_id,
            path: path.to_path_buf(),
            tag,
            existed: path.exists(),
        });
        if self.failing_tags.contains(&tag) {
            return Err(ApiError::Status {
                status: 503,
                body: "try later".to_string(),
            });
        }
        Ok(AttachmentMeta {
            id: Some(1000 + u64::from(tag)),
            observation_id,
            tag,
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })
    }
}

pub struct Rig {
    pub board: MockDeviceHandle,
    pub orchestrator: Orchestrator,
    pub events: EventReceiver,
}

impl Rig {
    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        self.orchestrator.supervisor()
    }

    pub fn drain_events(&mut self) -> Vec<InspectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn rig_with(health: HealthSettings) -> Rig {
    let board = MockDeviceHandle::default();
    let (sender, events) = events::channel();
    let manager = Arc::new(DeviceManager::new(
        Arc::new(MockConnector::new(board.clone())),
        sender,
    ));
    let supervisor = HealthSupervisor::new(manager, health);
    Rig {
        board,
        orchestrator: Orchestrator::new(supervisor),
        events,
    }
}

/// A rig whose link is already up
pub async fn connected_rig() -> Rig {
    let rig = rig_with(HealthSettings::default());
    assert_eq!(rig.supervisor().tick().await, LinkState::Connected);
    rig
}

pub fn run_settings(root: &Path) -> RunSettings {
    RunSettings {
        output_root: root.to_path_buf(),
        make_timestamped_subfolder: false,
        done_timeout_ms: 500,
        ..RunSettings::default()
    }
}

pub fn local_run(tooth_count: u32, capture_count: u32, root: &Path) -> InspectionRun {
    InspectionRun::new(tooth_count, capture_count, &run_settings(root))
}

pub async fn open_camera() -> (MockCamera, MockCameraHandle) {
    let (camera, shots) = MockCamera::new();
    let mut camera = camera.with_exposure(Duration::from_millis(1));
    camera.open().await.expect("mock camera opens");
    (camera, shots)
}

pub fn png_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".png"))
        .collect();
    names.sort();
    names
}
