use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Camera, CameraError, Frame, Result};

/// 1x1 transparent PNG
const PLACEHOLDER_PNG: [u8; 67] = [
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Debug, Default)]
struct MockCameraState {
    captured: Vec<PathBuf>,
    failing_captures: HashSet<usize>,
    attempts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockCameraHandle {
    state: Arc<Mutex<MockCameraState>>,
}

impl MockCameraHandle {
    fn with<R>(&self, f: impl FnOnce(&mut MockCameraState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn captured(&self) -> Vec<PathBuf> {
        self.with(|s| s.captured.clone())
    }

    /// The `ordinal`-th capture attempt (0-based) fails
    pub fn fail_capture(&self, ordinal: usize) {
        self.with(|s| {
            s.failing_captures.insert(ordinal);
        });
    }
}

/// Camera stand-in that writes a placeholder PNG after a simulated exposure.
pub struct MockCamera {
    open: bool,
    exposure: Duration,
    handle: MockCameraHandle,
}

impl MockCamera {
    pub fn new() -> (Self, MockCameraHandle) {
        let handle = MockCameraHandle::default();
        let camera = Self {
            open: false,
            exposure: Duration::from_millis(200),
            handle: handle.clone(),
        };
        (camera, handle)
    }

    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn open(&mut self) -> Result<()> {
        if !self.open {
            log::info!("Mock camera opened");
            self.open = true;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            log::info!("Mock camera closed");
            self.open = false;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.open.then(|| Frame {
            width: 1,
            height: 1,
            data: vec![0, 0, 0, 0],
        })
    }

    async fn capture_to(&mut self, path: &Path) -> Result<()> {
        if !self.open {
            return Err(CameraError::NotOpen);
        }

        let fail = self.handle.with(|s| {
            let ordinal = s.attempts;
            s.attempts += 1;
            s.failing_captures.contains(&ordinal)
        });
        tokio::time::sleep(self.exposure).await;
        if fail {
            return Err(CameraError::GrabFailed("simulated grab failure".to_string()));
        }

        tokio::fs::write(path, PLACEHOLDER_PNG).await?;
        self.handle.with(|s| s.captured.push(path.to_path_buf()));
        log::debug!("Mock picture saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_a_png_only_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        let (camera, shots) = MockCamera::new();
        let mut camera = camera.with_exposure(Duration::from_millis(1));

        assert!(matches!(camera.capture_to(&path).await, Err(CameraError::NotOpen)));
        assert!(camera.read_frame().is_none());

        camera.open().await.unwrap();
        camera.capture_to(&path).await.unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        assert_eq!(shots.captured(), vec![path]);
        assert!(camera.read_frame().is_some());

        camera.close().await;
        assert!(!camera.is_open());
    }

    #[tokio::test]
    async fn scripted_failures_hit_the_chosen_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (camera, shots) = MockCamera::new();
        let mut camera = camera.with_exposure(Duration::ZERO);
        shots.fail_capture(1);
        camera.open().await.unwrap();

        assert!(camera.capture_to(&dir.path().join("a.png")).await.is_ok());
        assert!(matches!(
            camera.capture_to(&dir.path().join("b.png")).await,
            Err(CameraError::GrabFailed(_))
        ));
        assert!(camera.capture_to(&dir.path().join("c.png")).await.is_ok());
        assert_eq!(shots.captured().len(), 2);
    }
}
