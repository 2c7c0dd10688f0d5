pub mod mock;

pub use mock::{MockCamera, MockCameraHandle};

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("Camera not open")]
    NotOpen,

    #[error("No camera found: {0}")]
    NoDevice(String),

    #[error("Frame grab failed: {0}")]
    GrabFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CameraError>;

/// One raw frame for live preview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Image sensor collaborator.
///
/// `capture_to` must discard frames buffered while the stage was moving, so
/// the saved image always reflects the post-motion position.
#[async_trait]
pub trait Camera: Send {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Best-effort, non-blocking preview frame
    fn read_frame(&mut self) -> Option<Frame>;
    async fn capture_to(&mut self, path: &Path) -> Result<()>;
}
