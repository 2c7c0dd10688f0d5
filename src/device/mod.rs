pub mod connector;
pub mod manager;
pub mod models;
pub mod supervisor;

pub use connector::{LinkConnector, MockConnector, SerialConnector};
pub use manager::{DeviceManager, LinkSlot};
pub use models::*;
pub use supervisor::{HealthSupervisor, SuspendGuard};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Device not connected")]
    NotConnected,

    #[error("Link error: {0}")]
    Link(#[from] crate::serial::LinkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::serial::ProtocolError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
