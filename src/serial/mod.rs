pub mod interface;
pub mod mock;
pub mod protocol;

pub use interface::{SerialInterface, SerialPortIO, SystemPort};
pub use protocol::{Command, MotionProtocol, ProtocolError, ProtocolMetrics, Token};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    #[error("Link not connected")]
    NotConnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
