//! One-shot camera check used by `--probe`

use tracing::{error, info, warn};

use crate::capture::{BackendOpener, CaptureBackendKind, CaptureConfig, CaptureError};

pub const PROBE_FRAMES: usize = 5;

/// Opens the configured backend (or the other one if that fails), reads
/// `frames` frames and closes it again. Returns the backend that worked.
pub fn probe(
    opener: &dyn BackendOpener,
    config: &CaptureConfig,
    frames: usize,
) -> Result<CaptureBackendKind, CaptureError> {
    let primary = config.backend;
    match probe_backend(opener, primary, config, frames) {
        Ok(()) => Ok(primary),
        Err(e) => {
            warn!(backend = %primary, error = %e, "Probe failed, trying fallback");
            let fallback = primary.other();
            probe_backend(opener, fallback, config, frames)
                .map(|()| fallback)
                .map_err(|e2| {
                    error!(backend = %fallback, error = %e2, "Fallback probe failed");
                    e2
                })
        }
    }
}

fn probe_backend(
    opener: &dyn BackendOpener,
    kind: CaptureBackendKind,
    config: &CaptureConfig,
    frames: usize,
) -> Result<(), CaptureError> {
    info!(backend = %kind, "Probing camera");
    let handle = opener.open(kind, config)?;
    info!(backend = %kind, "Camera opened");

    let result = (1..=frames).try_for_each(|n| {
        let frame = handle.read_frame()?;
        if frame.data.is_empty() {
            return Err(CaptureError::FrameReadFailed(format!("frame {} is empty", n)));
        }
        info!(backend = %kind, frame = n, width = frame.width, height = frame.height, "Frame read");
        Ok(())
    });

    handle.close();
    if result.is_ok() {
        info!(backend = %kind, "Probe passed");
    }
    result
}
