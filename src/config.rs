//! Configuration management
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! environment variables and command-line flags (applied by the binary).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::capture::{CaptureBackendKind, CaptureConfig};
use crate::stream::StreamSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
        }
    }
}

/// Camera selection and per-backend device settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// Backend opened at startup
    #[serde(default = "default_source")]
    pub source: CaptureBackendKind,

    /// V4L2 device index, `/dev/video{n}`
    #[serde(default)]
    pub opencv_device: usize,

    /// Explicit V4L2 device node, overrides `opencv-device`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opencv_path: Option<String>,

    #[serde(default = "default_width")]
    pub opencv_width: u32,

    #[serde(default = "default_height")]
    pub opencv_height: u32,

    /// Reported by the API only, libcamera picks its camera itself
    #[serde(default = "default_libcamera_device")]
    pub libcamera_device: String,

    /// libcamera camera id, e.g. "/base/soc/i2c0mux/i2c@1/imx219@10"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libcamera_camera_name: Option<String>,

    #[serde(default = "default_width")]
    pub libcamera_width: u32,

    #[serde(default = "default_height")]
    pub libcamera_height: u32,

    #[serde(default = "default_buffer_count")]
    pub libcamera_buffer_count: u32,

    #[serde(default = "default_fps")]
    pub libcamera_fps: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            opencv_device: 0,
            opencv_path: None,
            opencv_width: default_width(),
            opencv_height: default_height(),
            libcamera_device: default_libcamera_device(),
            libcamera_camera_name: None,
            libcamera_width: default_width(),
            libcamera_height: default_height(),
            libcamera_buffer_count: default_buffer_count(),
            libcamera_fps: default_fps(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Frame loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Consecutive failed frames before polling slows to `cooldown-ms`; 0 disables
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

// Default value functions
fn default_bind_ip() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_source() -> CaptureBackendKind { CaptureBackendKind::GenericDevice }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_libcamera_device() -> String { "/dev/video0".to_string() }
fn default_buffer_count() -> u32 { 6 }
fn default_fps() -> u32 { 30 }
fn default_read_timeout_ms() -> u64 { 2000 }
fn default_quality() -> u8 { 80 }
fn default_retry_delay_ms() -> u64 { 50 }
fn default_failure_threshold() -> u32 { 30 }
fn default_cooldown_ms() -> u64 { 1000 }

impl Config {
    /// Loads configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;

        if cam.opencv_width == 0 || cam.opencv_height == 0 {
            return Err(ConfigError::Invalid(
                "opencv-width and opencv-height must be > 0".to_string(),
            ));
        }

        if cam.opencv_width % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "opencv-width must be even for YUYV capture, got {}",
                cam.opencv_width
            )));
        }

        if cam.libcamera_width == 0 || cam.libcamera_height == 0 {
            return Err(ConfigError::Invalid(
                "libcamera-width and libcamera-height must be > 0".to_string(),
            ));
        }

        if cam.libcamera_buffer_count == 0 {
            return Err(ConfigError::Invalid(
                "libcamera-buffer-count must be > 0".to_string(),
            ));
        }

        if cam.libcamera_fps == 0 || cam.libcamera_fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "libcamera-fps must be between 1 and 120, got {}",
                cam.libcamera_fps
            )));
        }

        if cam.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read-timeout-ms must be > 0".to_string()));
        }

        if self.stream.quality == 0 || self.stream.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "quality must be between 1 and 100, got {}",
                self.stream.quality
            )));
        }

        Ok(())
    }

    /// Device settings handed to the camera session
    pub fn capture_config(&self) -> CaptureConfig {
        let cam = &self.camera;
        CaptureConfig {
            backend: cam.source,
            generic_index: cam.opencv_device,
            generic_path: cam.opencv_path.clone(),
            generic_width: cam.opencv_width,
            generic_height: cam.opencv_height,
            module_camera_name: cam.libcamera_camera_name.clone(),
            module_width: cam.libcamera_width,
            module_height: cam.libcamera_height,
            module_buffer_count: cam.libcamera_buffer_count,
            module_fps: cam.libcamera_fps,
            read_timeout: Duration::from_millis(cam.read_timeout_ms),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            quality: self.stream.quality,
            retry_delay: Duration::from_millis(self.stream.retry_delay_ms),
            failure_threshold: self.stream.failure_threshold,
            cooldown: Duration::from_millis(self.stream.cooldown_ms),
        }
    }

    /// What the API reports as the generic device
    pub fn opencv_device_label(&self) -> String {
        self.camera
            .opencv_path
            .clone()
            .unwrap_or_else(|| self.camera.opencv_device.to_string())
    }

    /// Points the generic backend at `/dev/video{index}`. A configured
    /// `opencv-path` would otherwise take precedence, so it is dropped.
    pub fn override_opencv_device(&mut self, index: usize) {
        if let Some(path) = self.camera.opencv_path.take() {
            warn!(path = %path, index, "Device index override replaces configured opencv-path");
        }
        self.camera.opencv_device = index;
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_ip, self.server.port)
    }
}
