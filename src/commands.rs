use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::api::{HttpInspectionApi, InspectionApi};
use crate::camera::Camera;
use crate::config::StationConfig;
use crate::device::{
    DeviceError, DeviceManager, HealthRecord, HealthSupervisor, LinkConnector, MockConnector,
    SerialConnector,
};
use crate::events::{EventSender, UploadProgress};
use crate::inspection::{
    cleanup_old_temp_dirs, run_with_api, ApiRunRequest, CleanupReport, InspectionRun,
    Orchestrator, RunOutput,
};
use crate::serial::mock::MockDeviceHandle;
use crate::serial::{ProtocolMetrics, SerialDeviceInfo, SerialInterface};
use crate::stop::StopSignal;

/// Everything a command needs: configuration, the link stack and the stop flag.
pub struct Station {
    pub config: StationConfig,
    pub orchestrator: Orchestrator,
    pub stop: StopSignal,
    simulated: Option<MockDeviceHandle>,
}

impl Station {
    pub fn new(config: StationConfig, simulated: bool, events: EventSender) -> Self {
        let (connector, handle): (Arc<dyn LinkConnector>, _) = if simulated {
            let handle = MockDeviceHandle::default();
            (Arc::new(MockConnector::new(handle.clone())), Some(handle))
        } else {
            (Arc::new(SerialConnector::new(config.serial.clone())), None)
        };

        let manager = Arc::new(DeviceManager::new(connector, events));
        let supervisor = HealthSupervisor::new(manager, config.health.clone());

        Self {
            config,
            orchestrator: Orchestrator::new(supervisor),
            stop: StopSignal::new(),
            simulated: handle,
        }
    }

    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        self.orchestrator.supervisor()
    }

    pub fn manager(&self) -> &Arc<DeviceManager> {
        self.supervisor().manager()
    }

    /// Handle onto the simulated board when running with `--mock`
    pub fn simulated_device(&self) -> Option<&MockDeviceHandle> {
        self.simulated.as_ref()
    }

    fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.config.run.done_timeout_ms)
    }
}

/// Options of the `inspect` command
#[derive(Debug, Clone, Default, clap::Args)]
pub struct InspectOptions {
    /// Number of teeth on the gear (read from the sample when --sample is given)
    #[arg(long)]
    pub teeth: Option<u32>,

    /// Captures to take; defaults to one per tooth
    #[arg(long)]
    pub captures: Option<u32>,

    /// Output root for local runs
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Write straight into the output root instead of a run_<timestamp> folder
    #[arg(long)]
    pub no_subfolder: bool,

    /// Sample identifier: resolve teeth and test case from the database and upload every capture
    #[arg(long)]
    pub sample: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectSummary {
    pub output_dir: PathBuf,
    pub captures: usize,
    pub uploads: UploadProgress,
    pub uploads_settled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub latency_ms: u64,
    pub metrics: ProtocolMetrics,
}

/// List candidate motion boards
pub fn list_ports() -> Result<Vec<SerialDeviceInfo>, String> {
    SerialInterface::discover_devices().map_err(|e| format!("Failed to list ports: {}", e))
}

/// Connect unless already connected
pub async fn ensure_connected(station: &Station) -> Result<(), String> {
    if station.manager().state().is_connected() {
        return Ok(());
    }
    station
        .manager()
        .connect_device()
        .await
        .map_err(|e| format!("Failed to connect to motion board: {}", e))
}

/// Energize the stepper driver
pub async fn hold(station: &Station) -> Result<(), String> {
    ensure_connected(station).await?;
    station
        .manager()
        .hold()
        .await
        .map_err(|e| format!("Failed to hold: {}", e))
}

/// De-energize the stepper driver
pub async fn release(station: &Station) -> Result<(), String> {
    ensure_connected(station).await?;
    station
        .manager()
        .release()
        .await
        .map_err(|e| format!("Failed to release: {}", e))
}

/// Define the current shaft position as 0 degrees
pub async fn zero(station: &Station) -> Result<(), String> {
    ensure_connected(station).await?;
    station
        .manager()
        .zero()
        .await
        .map_err(|e| format!("Failed to zero: {}", e))
}

/// Move to an absolute angle and wait for completion
pub async fn move_to(station: &Station, deg: f64) -> Result<(), String> {
    if !deg.is_finite() {
        return Err(format!("Invalid angle: {}", deg));
    }
    ensure_connected(station).await?;
    station
        .manager()
        .move_to(deg, station.done_timeout(), &station.stop)
        .await
        .map_err(|e| format!("Failed to move to {:.3} deg: {}", deg, e))
}

/// Round-trip a ping
pub async fn ping(station: &Station) -> Result<PingReport, String> {
    ensure_connected(station).await?;
    let started = Instant::now();
    let metrics = station
        .manager()
        .ping(station.config.health.ping_timeout())
        .await
        .map_err(|e| format!("Ping failed: {}", e))?;
    Ok(PingReport {
        latency_ms: started.elapsed().as_millis() as u64,
        metrics,
    })
}

/// Close the motion link if one is open
pub async fn disconnect(station: &Station) {
    match station.manager().disconnect_device().await {
        Ok(()) => {}
        Err(DeviceError::NotConnected) => log::debug!("No motion link to close"),
        Err(e) => log::warn!("Failed to disconnect: {}", e),
    }
}

/// Run a full inspection, locally or against the inspection database
pub async fn inspect(
    station: &Station,
    options: &InspectOptions,
    camera: &mut dyn Camera,
) -> Result<InspectSummary, String> {
    ensure_connected(station).await?;
    camera
        .open()
        .await
        .map_err(|e| format!("Failed to open camera: {}", e))?;

    let result = run_inspection(station, options, camera).await;
    camera.close().await;

    let drain_limit = Duration::from_millis(station.config.run.upload_drain_timeout_ms);
    let output = match result {
        Ok(output) => output,
        Err(e) => {
            if !station.orchestrator.drain_aborted_uploads(drain_limit).await {
                log::warn!("Uploads from the aborted run still in flight");
            }
            return Err(e);
        }
    };

    let output_dir = output.output_dir.clone();
    let captures = output.captures.len();
    let has_uploads = output.uploads.has_target();
    let uploads = output.finish(drain_limit).await;

    Ok(InspectSummary {
        output_dir,
        captures,
        uploads,
        uploads_settled: !has_uploads || uploads.completed_steps == uploads.total_steps,
    })
}

async fn run_inspection(
    station: &Station,
    options: &InspectOptions,
    camera: &mut dyn Camera,
) -> Result<RunOutput, String> {
    let settings = &station.config.run;

    if let Some(identifier) = &options.sample {
        let api = HttpInspectionApi::new(&station.config.api)
            .map_err(|e| format!("Failed to create API client: {}", e))?;
        let context = api
            .sample_context(identifier)
            .await
            .map_err(|e| format!("Failed to fetch sample {}: {}", identifier, e))?;
        let request = ApiRunRequest::from_context(&context)
            .map_err(|e| format!("Sample {} has no usable context: {}", identifier, e))?;
        if let Some(teeth) = options.teeth.filter(|t| *t != request.tooth_count) {
            log::warn!(
                "Ignoring --teeth {}; sample {} has {} teeth",
                teeth,
                identifier,
                request.tooth_count
            );
        }

        return run_with_api(
            &station.orchestrator,
            Arc::new(api),
            &request,
            settings,
            &std::env::temp_dir(),
            camera,
            &station.stop,
            |_| {},
        )
        .await
        .map_err(|e| format!("Inspection failed: {}", e));
    }

    let teeth = options
        .teeth
        .ok_or_else(|| "Either --teeth or --sample is required".to_string())?;
    let mut run = InspectionRun::new(teeth, options.captures.unwrap_or(teeth), settings);
    if let Some(output) = &options.output {
        run = run.with_output_root(output);
    }
    if options.no_subfolder {
        run.make_timestamped_subfolder = false;
    }

    station
        .orchestrator
        .run(&run, camera, &station.stop, |_| {})
        .await
        .map_err(|e| format!("Inspection failed: {}", e))
}

/// Delete temporary run directories older than `max_age_hours`
pub async fn cleanup_temp(max_age_hours: u64) -> Result<CleanupReport, String> {
    let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
    tokio::task::spawn_blocking(move || cleanup_old_temp_dirs(max_age))
        .await
        .map_err(|e| format!("Cleanup task failed: {}", e))
}

/// Run the health supervisor until stopped or `duration` elapses
pub async fn monitor(station: &Station, duration: Option<Duration>) -> Result<HealthRecord, String> {
    let supervisor = station.supervisor();
    supervisor.start().await;

    let started = Instant::now();
    while !station.stop.is_set() && duration.map_or(true, |d| started.elapsed() < d) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    supervisor.shutdown().await;
    Ok(supervisor.record())
}
