use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CaptureBackend, CaptureBackendKind, CaptureConfig, CaptureError, RawFrame};

const SOURCE_ELEMENT: &str = "libcamerasrc";

struct Pipeline {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

/// Camera module captured through a GStreamer `libcamerasrc` pipeline.
///
/// The pipeline is configured and started on open; frames are pulled from an
/// `appsink` as BGRx and repacked to RGB.
pub struct LibcameraCamera {
    read_timeout: Duration,
    inner: Mutex<Option<Pipeline>>,
}

impl LibcameraCamera {
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("GStreamer initialisation failed: {}", e))
        })?;

        if gst::ElementFactory::find(SOURCE_ELEMENT).is_none() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "GStreamer element '{}' is not installed",
                SOURCE_ELEMENT
            )));
        }

        let description = build_pipeline_description(config);
        info!(
            camera = config.module_camera_name.as_deref().unwrap_or("auto"),
            resolution = %format!("{}x{}", config.module_width, config.module_height),
            fps = config.module_fps,
            buffers = config.module_buffer_count,
            "Opening libcamera camera"
        );
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CaptureError::InitFailed(format!("failed to create pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::InitFailed("parsed element is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::InitFailed("element 'sink' not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::InitFailed("element 'sink' is not an appsink".into()))?;

        let started = Pipeline { pipeline, appsink };
        if let Err(e) = start(&started.pipeline, config.read_timeout) {
            if let Err(stop_err) = started.pipeline.set_state(gst::State::Null) {
                warn!(error = ?stop_err, "Failed to stop libcamera pipeline after failed start");
            }
            return Err(e);
        }

        info!("libcamera pipeline playing");
        Ok(Self {
            read_timeout: config.read_timeout,
            inner: Mutex::new(Some(started)),
        })
    }
}

impl CaptureBackend for LibcameraCamera {
    fn kind(&self) -> CaptureBackendKind {
        CaptureBackendKind::ModuleCamera
    }

    fn read_frame(&self) -> Result<RawFrame, CaptureError> {
        let guard = self.inner.lock();
        let open = guard
            .as_ref()
            .ok_or_else(|| CaptureError::FrameReadFailed("pipeline is closed".into()))?;

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = match open.appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None => {
                let reason = bus_error(&open.pipeline).unwrap_or_else(|| {
                    if open.appsink.is_eos() {
                        "end of stream".to_string()
                    } else {
                        format!("no frame within {:?}", self.read_timeout)
                    }
                });
                return Err(CaptureError::FrameReadFailed(reason));
            }
        };

        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::FrameReadFailed("sample had no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::FrameReadFailed(format!("unreadable caps: {}", e)))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::FrameReadFailed("sample had no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::FrameReadFailed("unable to map buffer".into()))?;

        let stride = info.stride().first().copied().unwrap_or(0).max(0) as u32;
        bgrx_to_rgb(map.as_slice(), info.width(), info.height(), stride)
    }

    fn close(&self) {
        if let Some(open) = self.inner.lock().take() {
            if let Err(e) = open.pipeline.set_state(gst::State::Null) {
                warn!(error = ?e, "Failed to stop libcamera pipeline");
            }
            info!("libcamera camera closed");
        }
    }
}

impl Drop for LibcameraCamera {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_pipeline_description(config: &CaptureConfig) -> String {
    let camera = match &config.module_camera_name {
        Some(name) => format!("camera-name=\"{}\" ", name),
        None => String::new(),
    };

    format!(
        "{src} {camera}! video/x-raw,width={w},height={h},framerate={fps}/1 \
         ! queue max-size-buffers={buffers} leaky=downstream \
         ! videoconvert ! video/x-raw,format=BGRx \
         ! appsink name=sink max-buffers=2 drop=true sync=false",
        src = SOURCE_ELEMENT,
        camera = camera,
        w = config.module_width,
        h = config.module_height,
        fps = config.module_fps,
        buffers = config.module_buffer_count,
    )
}

fn start(pipeline: &gst::Pipeline, timeout: Duration) -> Result<(), CaptureError> {
    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| CaptureError::InitFailed(format!("failed to start pipeline: {:?}", e)))?;

    let (result, current, pending) =
        pipeline.state(gst::ClockTime::from_mseconds(timeout.as_millis() as u64));
    match result {
        Ok(gst::StateChangeSuccess::Async) => Err(CaptureError::InitFailed(format!(
            "pipeline stuck in {:?} (pending {:?})",
            current, pending
        ))),
        Ok(_) => Ok(()),
        Err(_) => Err(CaptureError::InitFailed(
            bus_error(pipeline).unwrap_or_else(|| "pipeline refused to start".to_string()),
        )),
    }
}

/// Pops the most recent error off the pipeline bus, if any
fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => {
            let src = err
                .src()
                .map(|s| s.path_string().to_string())
                .unwrap_or_else(|| "unknown".into());
            Some(format!("{}: {}", src, err.error()))
        }
        _ => None,
    }
}

/// Repacks BGRx rows (4 bytes per pixel, optional row padding) into RGB
fn bgrx_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
) -> Result<RawFrame, CaptureError> {
    let (w, h) = (width as usize, height as usize);
    let stride = if stride == 0 { w * 4 } else { stride as usize };
    if w == 0 || h == 0 || stride < w * 4 || data.len() < stride * (h - 1) + w * 4 {
        return Err(CaptureError::FrameReadFailed(format!(
            "short BGRx frame: {} bytes for {}x{}",
            data.len(),
            width,
            height
        )));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in data.chunks(stride).take(h) {
        for px in row[..w * 4].chunks_exact(4) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }

    Ok(RawFrame::new(width, height, rgb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_bgrx_swaps_channels() {
        let data = [10, 20, 30, 255, 40, 50, 60, 255];
        let frame = bgrx_to_rgb(&data, 2, 1, 8).unwrap();
        assert_eq!(frame.data, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn test_bgrx_respects_stride() {
        let mut data = vec![0u8; 16];
        data[..4].copy_from_slice(&[1, 2, 3, 0]);
        data[8..12].copy_from_slice(&[4, 5, 6, 0]);

        let frame = bgrx_to_rgb(&data, 1, 2, 8).unwrap();
        assert_eq!(frame.data, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_bgrx_short_buffer() {
        assert_matches!(
            bgrx_to_rgb(&[0u8; 7], 2, 1, 8),
            Err(CaptureError::FrameReadFailed(_))
        );
    }

    #[test]
    fn test_pipeline_description() {
        let config = CaptureConfig {
            module_camera_name: Some("/base/soc/i2c0mux/i2c@1/imx219@10".to_string()),
            module_width: 1280,
            module_height: 720,
            module_fps: 15,
            module_buffer_count: 6,
            ..Default::default()
        };

        let desc = build_pipeline_description(&config);
        assert!(desc.starts_with("libcamerasrc camera-name=\"/base/soc/i2c0mux/i2c@1/imx219@10\""));
        assert!(desc.contains("width=1280,height=720,framerate=15/1"));
        assert!(desc.contains("max-size-buffers=6"));
        assert!(desc.contains("format=BGRx"));
        assert!(desc.contains("appsink name=sink"));
    }

    #[test]
    fn test_pipeline_description_without_camera_name() {
        let desc = build_pipeline_description(&CaptureConfig::default());
        assert!(desc.starts_with("libcamerasrc ! video/x-raw,width=640,height=480"));
    }
}
