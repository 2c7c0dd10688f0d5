pub mod api;
pub mod camera;
pub mod commands;
pub mod config;
pub mod device;
pub mod events;
pub mod inspection;
pub mod kinematics;
pub mod serial;
pub mod stop;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use camera::{Camera, MockCamera};
use commands::{InspectOptions, Station};
use config::StationConfig;
use events::EventReceiver;

#[derive(Debug, Parser)]
#[command(name = "gear-inspector", version, about = "Rotary-stage gear tooth inspection")]
struct Cli {
    /// Station configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated motion board and camera
    #[arg(long, global = true)]
    mock: bool,

    /// Simulate only the camera
    #[arg(long, global = true)]
    mock_camera: bool,

    /// Print events and results as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List connected motion boards
    Ports,
    /// Energize the motor
    Hold,
    /// De-energize the motor
    Release,
    /// Set the current position as 0 degrees
    Zero,
    /// Move to an absolute angle
    Move {
        #[arg(long, allow_negative_numbers = true)]
        deg: f64,
    },
    /// Check the link round-trip
    Ping,
    /// Capture every tooth of a gear
    Inspect(InspectOptions),
    /// Delete stale temporary run directories
    CleanupTemp {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
    /// Supervise the link and print state changes until Ctrl-C
    Monitor {
        #[arg(long)]
        seconds: Option<u64>,
    },
}

/// Human line plus the same result as JSON
struct Report {
    message: String,
    data: Value,
}

fn report<T: Serialize>(message: impl Into<String>, data: &T) -> Report {
    Report {
        message: message.into(),
        data: serde_json::to_value(data).unwrap_or(Value::Null),
    }
}

pub fn run() {
    let cli = Cli::parse();

    let config = match StationConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };
    init_logging(config.log_level.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            std::process::exit(2);
        }
    };

    let code = runtime.block_on(execute(cli, config));
    std::process::exit(code);
}

fn init_logging(level: Option<&str>) {
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();
}

async fn execute(cli: Cli, config: StationConfig) -> i32 {
    let (events, rx) = events::channel();
    let printer = tokio::spawn(print_events(rx, cli.json));
    let station = Station::new(config, cli.mock, events);

    let stop = station.stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Stop requested");
            stop.trigger();
        }
    });

    let result = dispatch(&cli, &station).await;

    station.supervisor().shutdown().await;
    commands::disconnect(&station).await;
    drop(station);
    // Senders held by straggling uploads keep the printer alive; don't wait on them
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match result {
        Ok(report) => {
            if cli.json {
                println!("{}", report.data);
            } else {
                println!("{}", report.message);
            }
            0
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}", e);
            1
        }
    }
}

async fn dispatch(cli: &Cli, station: &Station) -> Result<Report, String> {
    match &cli.command {
        CliCommand::Ports => {
            let ports = commands::list_ports()?;
            let message = if ports.is_empty() {
                "No motion board found".to_string()
            } else {
                ports
                    .iter()
                    .map(|p| format!("{} ({:04x}:{:04x})", p.port_name, p.vid, p.pid))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(report(message, &ports))
        }
        CliCommand::Hold => {
            commands::hold(station).await?;
            Ok(report("Holding", &"hold"))
        }
        CliCommand::Release => {
            commands::release(station).await?;
            Ok(report("Released", &"release"))
        }
        CliCommand::Zero => {
            commands::zero(station).await?;
            Ok(report("Position zeroed", &"zero"))
        }
        CliCommand::Move { deg } => {
            commands::move_to(station, *deg).await?;
            Ok(report(format!("At {:.3} deg", deg), deg))
        }
        CliCommand::Ping => {
            let ping = commands::ping(station).await?;
            let message = format!(
                "PONG in {} ms ({} lines read, {} noise)",
                ping.latency_ms, ping.metrics.lines_read, ping.metrics.noise_lines
            );
            Ok(report(message, &ping))
        }
        CliCommand::Inspect(options) => {
            let mut camera: Box<dyn Camera> = if cli.mock || cli.mock_camera {
                Box::new(MockCamera::new().0)
            } else {
                return Err("No camera driver available; run with --mock-camera".to_string());
            };
            let summary = commands::inspect(station, options, camera.as_mut()).await?;
            let message = format!(
                "{} captures in {} ({} uploaded, {} failed)",
                summary.captures,
                summary.output_dir.display(),
                summary.uploads.uploaded,
                summary.uploads.failed
            );
            Ok(report(message, &summary))
        }
        CliCommand::CleanupTemp { max_age_hours } => {
            let cleanup = commands::cleanup_temp(*max_age_hours).await?;
            let message = format!(
                "Deleted {}, skipped {} recent, {} failed",
                cleanup.deleted.len(),
                cleanup.skipped_recent,
                cleanup.failed.len()
            );
            Ok(report(message, &cleanup))
        }
        CliCommand::Monitor { seconds } => {
            let record = commands::monitor(station, seconds.map(Duration::from_secs)).await?;
            Ok(report(
                format!("{} consecutive failures at exit", record.consecutive_failures),
                &record,
            ))
        }
    }
}

async fn print_events(mut rx: EventReceiver, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => log::warn!("Unserializable event: {}", e),
            }
        } else {
            println!("{}", event);
        }
    }
}
