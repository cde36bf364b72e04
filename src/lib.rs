//! MJPEG-over-HTTP camera server for Raspberry Pi
//!
//! This library provides:
//! - Two capture backends behind one handle lifecycle: V4L2 webcams and
//!   libcamera camera modules (through GStreamer)
//! - A camera session that switches backends at runtime without ever holding
//!   two device handles
//! - Per-client `multipart/x-mixed-replace` JPEG streams that survive capture
//!   errors and end when the client goes away
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpi_mjpeg_streamer::{CameraSession, CaptureConfig, SystemBackends};
//!
//! let session = CameraSession::new(CaptureConfig::default(), Arc::new(SystemBackends));
//! if session.initialize().is_some() {
//!     let frame = session.get_frame();
//! }
//! session.release();
//! ```

pub mod capture;
pub mod config;
pub mod encoder;
pub mod probe;
pub mod session;
pub mod stream;
pub mod web;

// Re-exports for convenience
pub use capture::{
    BackendOpener, CaptureBackend, CaptureBackendKind, CaptureConfig, CaptureError, RawFrame,
    SystemBackends,
};
pub use config::{Config, ConfigError};
pub use encoder::{encode, EncodeError, EncodedFrame, DEFAULT_QUALITY};
pub use session::{CameraSession, SessionPhase, SessionStatus};
pub use stream::{MjpegStreamer, StreamSettings, StreamStatsSnapshot};
pub use web::{router, run_server, AppState};
