use parking_lot::Mutex;
use tracing::{debug, info, warn};
use v4l::{
    buffer::Type,
    capability::Flags,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::Capture,
    Device, Format, FourCC,
};

use super::{CaptureBackend, CaptureBackendKind, CaptureConfig, CaptureError, RawFrame};

const STREAM_BUFFERS: u32 = 4;

/// Device formats we know how to turn into RGB, in order of preference
const PREFERRED_FORMATS: [&[u8; 4]; 3] = [b"YUYV", b"RGB3", b"MJPG"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Yuyv,
    Rgb3,
    Mjpeg,
}

impl PixelLayout {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb3),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

struct OpenStream {
    // Dropped before `_device`, which stops streaming and unmaps the buffers
    stream: MmapStream<'static>,
    _device: Device,
    format: Format,
    layout: PixelLayout,
}

/// Generic V4L2 webcam read through a blocking mmap stream.
pub struct V4lCamera {
    path: String,
    inner: Mutex<Option<OpenStream>>,
}

// The v4l stream and device types don't implement Debug, so it can't be derived
impl std::fmt::Debug for V4lCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4lCamera")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl V4lCamera {
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let path = config.generic_device();
        info!(
            device = %path,
            resolution = %format!("{}x{}", config.generic_width, config.generic_height),
            "Opening V4L2 camera"
        );

        let device = match &config.generic_path {
            Some(path) => Device::with_path(path),
            None => Device::new(config.generic_index),
        }
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", path, e)))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", path, e)))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} ({}) is not a video capture device",
                path, caps.card
            )));
        }
        debug!(device = %path, card = %caps.card, driver = %caps.driver, "Device opened");

        let (format, layout) =
            negotiate_format(&device, config.generic_width, config.generic_height)
                .map_err(|e| CaptureError::InitFailed(format!("{}: {}", path, e)))?;
        info!(device = %path, format = %format, "Camera format set");

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CaptureError::InitFailed(format!("{}: failed to start stream: {}", path, e))
            })?;

        Ok(Self {
            path,
            inner: Mutex::new(Some(OpenStream {
                stream,
                _device: device,
                format,
                layout,
            })),
        })
    }
}

impl CaptureBackend for V4lCamera {
    fn kind(&self) -> CaptureBackendKind {
        CaptureBackendKind::GenericDevice
    }

    fn read_frame(&self) -> Result<RawFrame, CaptureError> {
        let mut guard = self.inner.lock();
        let open = guard
            .as_mut()
            .ok_or_else(|| CaptureError::FrameReadFailed(format!("{} is closed", self.path)))?;

        let (buf, meta) = open
            .stream
            .next()
            .map_err(|e| CaptureError::FrameReadFailed(format!("{}: {}", self.path, e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used == 0 { buf } else { &buf[..used] };

        let format = &open.format;
        match open.layout {
            PixelLayout::Yuyv => yuyv_to_rgb(data, format.width, format.height, format.stride),
            PixelLayout::Rgb3 => rgb_rows(data, format.width, format.height, format.stride),
            PixelLayout::Mjpeg => decode_mjpeg(data),
        }
    }

    fn close(&self) {
        if self.inner.lock().take().is_some() {
            info!(device = %self.path, "V4L2 camera closed");
        }
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        self.close();
    }
}

fn negotiate_format(
    device: &Device,
    width: u32,
    height: u32,
) -> std::io::Result<(Format, PixelLayout)> {
    for fourcc in PREFERRED_FORMATS {
        let requested = Format::new(width, height, FourCC::new(fourcc));
        let actual = device.set_format(&requested)?;
        if let Some(layout) = PixelLayout::from_fourcc(actual.fourcc) {
            if actual.width != width || actual.height != height {
                warn!(
                    requested = %format!("{}x{}", width, height),
                    actual = %format!("{}x{}", actual.width, actual.height),
                    "Device adjusted frame size"
                );
            }
            return Ok((actual, layout));
        }
        debug!(requested = %requested.fourcc, actual = %actual.fourcc, "Format rejected");
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "device offers none of YUYV, RGB3, MJPG",
    ))
}

/// BT.601 YUYV 4:2:2 to packed RGB
fn yuyv_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
) -> Result<RawFrame, CaptureError> {
    let (w, h) = (width as usize, height as usize);
    let stride = if stride == 0 { w * 2 } else { stride as usize };
    if w == 0 || h == 0 || w % 2 != 0 || stride < w * 2 || data.len() < stride * (h - 1) + w * 2 {
        return Err(CaptureError::FrameReadFailed(format!(
            "short YUYV frame: {} bytes for {}x{}",
            data.len(),
            width,
            height
        )));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in data.chunks(stride).take(h) {
        for px in row[..w * 2].chunks_exact(4) {
            let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
            rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
            rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
        }
    }

    Ok(RawFrame::new(width, height, rgb))
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Strips row padding from a packed RGB24 buffer
fn rgb_rows(data: &[u8], width: u32, height: u32, stride: u32) -> Result<RawFrame, CaptureError> {
    let (w, h) = (width as usize, height as usize);
    let stride = if stride == 0 { w * 3 } else { stride as usize };
    if w == 0 || h == 0 || stride < w * 3 || data.len() < stride * (h - 1) + w * 3 {
        return Err(CaptureError::FrameReadFailed(format!(
            "short RGB frame: {} bytes for {}x{}",
            data.len(),
            width,
            height
        )));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in data.chunks(stride).take(h) {
        rgb.extend_from_slice(&row[..w * 3]);
    }
    Ok(RawFrame::new(width, height, rgb))
}

fn decode_mjpeg(data: &[u8]) -> Result<RawFrame, CaptureError> {
    let image = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| CaptureError::FrameReadFailed(format!("corrupt MJPEG frame: {}", e)))?
        .to_rgb8();
    Ok(RawFrame::new(image.width(), image.height(), image.into_raw()))
}
