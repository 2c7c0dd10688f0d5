//! Station configuration: serial link, health cadence, run defaults, API endpoint.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is valid. Environment variables override the file for the
//! values that differ per workstation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_API_BASE_URL: &str = "INSPECTION_API_BASE_URL";
pub const ENV_SERIAL_PORT: &str = "INSPECTION_SERIAL_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// `None` auto-detects the motion board by USB id
    pub port: Option<String>,
    pub baud: u32,
    /// Boards reboot when the port opens; wait this long before talking
    pub reset_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            reset_delay_ms: 2000,
            read_timeout_ms: 50,
            write_timeout_ms: 200,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub reconnect_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 1500,
            ping_interval_ms: 3000,
            ping_timeout_ms: 200,
        }
    }
}

impl HealthSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub output_root: PathBuf,
    pub make_timestamped_subfolder: bool,
    pub done_timeout_ms: u64,
    pub cleanup_on_upload_success: bool,
    pub max_concurrent_uploads: usize,
    pub upload_drain_timeout_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("captures"),
            make_timestamped_subfolder: true,
            done_timeout_ms: 15_000,
            cleanup_on_upload_success: true,
            max_concurrent_uploads: 4,
            upload_drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// The plant database serves a self-signed certificate
    pub accept_invalid_certs: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/api".to_string(),
            request_timeout_ms: 10_000,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub serial: SerialSettings,
    pub health: HealthSettings,
    pub run: RunSettings,
    pub api: ApiSettings,
    pub log_level: Option<String>,
}

impl StationConfig {
    /// Read `path` if given, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_json(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.api.base_url = url;
        }
        if let Some(port) = lookup(ENV_SERIAL_PORT).filter(|v| !v.trim().is_empty()) {
            self.serial.port = Some(port);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.serial.baud == 0, "serial.baud must be > 0"),
            (self.serial.read_timeout_ms == 0, "serial.read_timeout_ms must be > 0"),
            (self.health.reconnect_interval_ms == 0, "health.reconnect_interval_ms must be > 0"),
            (self.health.ping_interval_ms == 0, "health.ping_interval_ms must be > 0"),
            (self.health.ping_timeout_ms == 0, "health.ping_timeout_ms must be > 0"),
            (self.run.done_timeout_ms == 0, "run.done_timeout_ms must be > 0"),
            (self.run.max_concurrent_uploads == 0, "run.max_concurrent_uploads must be > 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }
}
