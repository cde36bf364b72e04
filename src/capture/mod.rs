//! Capture backends
//!
//! Two unrelated drivers sit behind the same handle lifecycle:
//! - [`V4lCamera`]: a generic V4L2 webcam read through a blocking mmap stream
//! - [`LibcameraCamera`]: a camera module driven by a GStreamer `libcamerasrc` pipeline
//!
//! Both hand out frames in RGB order so the encoder never has to care which one is active.

mod libcamera;
mod v4l_device;

pub use libcamera::LibcameraCamera;
pub use v4l_device::V4lCamera;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error("frame read failed: {0}")]
    FrameReadFailed(String),

    #[error("camera not initialized")]
    NotInitialized,

    #[error("invalid camera source '{0}', expected 'opencv' or 'libcamera'")]
    InvalidBackend(String),
}

/// Which driver owns the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum CaptureBackendKind {
    #[serde(rename = "opencv", alias = "generic", alias = "v4l2")]
    GenericDevice,

    #[serde(rename = "libcamera", alias = "module", alias = "picamera")]
    ModuleCamera,
}

impl CaptureBackendKind {
    /// Name used by the HTTP API and the configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenericDevice => "opencv",
            Self::ModuleCamera => "libcamera",
        }
    }

    /// The backend tried when this one cannot be opened at startup
    pub fn other(&self) -> Self {
        match self {
            Self::GenericDevice => Self::ModuleCamera,
            Self::ModuleCamera => Self::GenericDevice,
        }
    }
}

impl fmt::Display for CaptureBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureBackendKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opencv" | "generic" | "v4l2" => Ok(Self::GenericDevice),
            "libcamera" | "module" | "picamera" => Ok(Self::ModuleCamera),
            _ => Err(CaptureError::InvalidBackend(s.to_string())),
        }
    }
}

/// Per-backend device settings, fixed for the lifetime of the process
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,

    /// `/dev/video{index}` unless `generic_path` is set
    pub generic_index: usize,
    pub generic_path: Option<String>,
    pub generic_width: u32,
    pub generic_height: u32,

    /// libcamera camera id; the first camera when unset
    pub module_camera_name: Option<String>,
    pub module_width: u32,
    pub module_height: u32,
    pub module_buffer_count: u32,
    pub module_fps: u32,

    pub read_timeout: Duration,
}

impl CaptureConfig {
    /// Device node the generic backend opens
    pub fn generic_device(&self) -> String {
        self.generic_path
            .clone()
            .unwrap_or_else(|| format!("/dev/video{}", self.generic_index))
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::GenericDevice,
            generic_index: 0,
            generic_path: None,
            generic_width: 640,
            generic_height: 480,
            module_camera_name: None,
            module_width: 640,
            module_height: 480,
            module_buffer_count: 6,
            module_fps: 30,
            read_timeout: Duration::from_millis(2000),
        }
    }
}

/// A decoded frame, `width * height * 3` bytes in RGB order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Frame filled with a single color
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(width, height, data)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// An open camera. Exactly one exists per active backend.
pub trait CaptureBackend: Send + Sync {
    fn kind(&self) -> CaptureBackendKind;

    /// Blocks until the next frame is available
    fn read_frame(&self) -> Result<RawFrame, CaptureError>;

    /// Releases the device. Safe to call more than once.
    fn close(&self);
}

/// Constructs backend handles; swapped for mocks in tests
pub trait BackendOpener: Send + Sync {
    fn open(
        &self,
        kind: CaptureBackendKind,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError>;
}

/// Opens the real hardware drivers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackends;

impl BackendOpener for SystemBackends {
    fn open(
        &self,
        kind: CaptureBackendKind,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        match kind {
            CaptureBackendKind::GenericDevice => Ok(Box::new(V4lCamera::open(config)?)),
            CaptureBackendKind::ModuleCamera => Ok(Box::new(LibcameraCamera::open(config)?)),
        }
    }
}
