use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use tokio::time::timeout;

use super::{LinkError, Result, SerialDeviceInfo};
use crate::config::SerialSettings;

// Motion board USB bridge (CH340-family)
pub const MOTION_VID: u16 = 0x1A86;
pub const MOTION_PID: u16 = 0x55D4;

/// Byte-stream seam between the protocol engine and whatever carries the bytes.
///
/// `read_data` returns `LinkError::Timeout` when nothing arrived inside the
/// poll window; callers treat that as "no data yet", not as a failure.
#[async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;
    async fn flush(&mut self) -> Result<()>;
    async fn clear_input(&mut self) -> Result<()>;
}

/// Hardware port backed by the `serialport` crate.
pub struct SystemPort {
    port: Box<dyn SerialPort>,
    poll_interval: Duration,
}

impl SystemPort {
    pub fn new(port: Box<dyn SerialPort>, poll_interval: Duration) -> Self {
        Self { port, poll_interval }
    }
}

#[async_trait]
impl SerialPortIO for SystemPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(LinkError::IoError)?;
        self.port.flush().map_err(LinkError::IoError)?;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = &mut self.port;
        let poll_interval = self.poll_interval;

        let read_operation = async {
            loop {
                match port.bytes_to_read() {
                    Ok(0) => tokio::time::sleep(poll_interval).await,
                    Ok(_) => match port.read(buf) {
                        Ok(0) => tokio::time::sleep(poll_interval).await,
                        Ok(n) => return Ok(n),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            tokio::time::sleep(poll_interval).await
                        }
                        Err(e) => return Err(LinkError::IoError(e)),
                    },
                    Err(e) => return Err(LinkError::SerialportError(e)),
                }
            }
        };

        timeout(Duration::from_millis(timeout_ms), read_operation)
            .await
            .map_err(|_| LinkError::Timeout)?
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(LinkError::IoError)
    }

    async fn clear_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Open/close wrapper around a [`SerialPortIO`] with the identity of the far end.
pub struct SerialInterface {
    port: Option<Box<dyn SerialPortIO>>,
    port_name: Option<String>,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            port: None,
            port_name: None,
        }
    }

    /// Wrap an already-open byte stream (simulated devices, tests).
    pub fn from_io(io: Box<dyn SerialPortIO>, port_name: impl Into<String>) -> Self {
        Self {
            port: Some(io),
            port_name: Some(port_name.into()),
        }
    }

    /// Discover ports that look like the motion board
    pub fn discover_devices() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                if usb_info.vid == MOTION_VID && usb_info.pid == MOTION_PID {
                    devices.push(SerialDeviceInfo {
                        port_name: port.port_name.clone(),
                        vid: usb_info.vid,
                        pid: usb_info.pid,
                        serial_number: usb_info.serial_number.clone(),
                        manufacturer: usb_info.manufacturer.clone(),
                        product: usb_info.product.clone(),
                    });
                }
            }
        }

        Ok(devices)
    }

    /// First port matching the motion board's USB identifiers
    pub fn find_motion_port() -> Result<String> {
        Self::discover_devices()?
            .into_iter()
            .next()
            .map(|d| d.port_name)
            .ok_or_else(|| LinkError::PortNotFound("motion board (CH340) not found".to_string()))
    }

    /// Open a hardware port. `settings.port == None` auto-detects the board.
    pub fn connect(&mut self, settings: &SerialSettings) -> Result<()> {
        let port_name = match &settings.port {
            Some(name) => name.clone(),
            None => Self::find_motion_port()?,
        };

        let port = serialport::new(&port_name, settings.baud)
            .timeout(Duration::from_millis(settings.write_timeout_ms))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => LinkError::PortNotFound(port_name.clone()),
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    LinkError::PortNotFound(port_name.clone())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    LinkError::PermissionDenied(port_name.clone())
                }
                _ => LinkError::ConnectionFailed(e.to_string()),
            })?;

        let poll = Duration::from_millis(settings.poll_interval_ms);
        self.port = Some(Box::new(SystemPort::new(port, poll)));
        self.port_name = Some(port_name.clone());

        log::info!("Opened motion link on {}", port_name);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(name) = &self.port_name {
            log::info!("Closing motion link on {}", name);
        }
        self.port = None;
        self.port_name = None;
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn io(&mut self) -> Result<&mut Box<dyn SerialPortIO>> {
        self.port.as_mut().ok_or(LinkError::NotConnected)
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let port = self.io()?;
        port.send_data(data).await?;
        port.flush().await
    }

    pub async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        self.io()?.read_data(buffer, timeout_ms).await
    }

    pub async fn clear_input(&mut self) -> Result<()> {
        self.io()?.clear_input().await
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}
