use std::time::Duration;

use async_trait::async_trait;

use crate::config::SerialSettings;
use crate::serial::mock::{MockDevice, MockDeviceHandle};
use crate::serial::{LinkError, MotionProtocol, SerialInterface};

/// Opens a fresh motion link; used for the first connect and every reconnect.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self) -> crate::serial::Result<MotionProtocol>;
    fn describe(&self) -> String;
}

pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LinkConnector for SerialConnector {
    async fn connect(&self) -> crate::serial::Result<MotionProtocol> {
        let settings = self.settings.clone();
        let interface = tokio::task::spawn_blocking(move || {
            let mut interface = SerialInterface::new();
            interface.connect(&settings).map(|()| interface)
        })
        .await
        .map_err(|e| LinkError::ConnectionFailed(e.to_string()))??;

        // The board resets when the port opens and ignores input while booting
        if self.settings.reset_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.reset_delay_ms)).await;
        }

        Ok(MotionProtocol::new(interface, self.settings.read_timeout_ms))
    }

    fn describe(&self) -> String {
        self.settings
            .port
            .clone()
            .unwrap_or_else(|| "auto-detect".to_string())
    }
}

/// Connects to a simulated board; fails while the handle reports it unplugged.
pub struct MockConnector {
    handle: MockDeviceHandle,
    read_window_ms: u64,
}

impl MockConnector {
    pub fn new(handle: MockDeviceHandle) -> Self {
        Self {
            handle,
            read_window_ms: 10,
        }
    }
}

#[async_trait]
impl LinkConnector for MockConnector {
    async fn connect(&self) -> crate::serial::Result<MotionProtocol> {
        if self.handle.is_unplugged() {
            return Err(LinkError::PortNotFound("mock".to_string()));
        }
        let io = MockDevice::attach(self.handle.clone());
        let interface = SerialInterface::from_io(Box::new(io), "mock");
        Ok(MotionProtocol::new(interface, self.read_window_ms))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
