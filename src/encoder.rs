//! JPEG encoding of raw RGB frames

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::capture::RawFrame;

/// Quality used for the live preview stream
pub const DEFAULT_QUALITY: u8 = 80;

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Largest dimension a baseline JPEG can describe
const MAX_DIMENSION: u32 = u16::MAX as u32;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("encode failed: {0}")]
    EncodeFailed(String),
}

/// A compressed frame ready to be written to a client
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub content_type: &'static str,
}

/// Compresses `frame` to JPEG. Quality is clamped to 1..=100.
pub fn encode(frame: &RawFrame, quality: u8) -> Result<EncodedFrame, EncodeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(EncodeError::EncodeFailed(format!(
            "empty frame {}x{}",
            frame.width, frame.height
        )));
    }
    if frame.width > MAX_DIMENSION || frame.height > MAX_DIMENSION {
        return Err(EncodeError::EncodeFailed(format!(
            "frame {}x{} exceeds JPEG limits",
            frame.width, frame.height
        )));
    }
    if frame.data.len() != frame.expected_len() {
        return Err(EncodeError::EncodeFailed(format!(
            "buffer holds {} bytes, {}x{}x3 needs {}",
            frame.data.len(),
            frame.width,
            frame.height,
            frame.expected_len()
        )));
    }

    let mut out = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| EncodeError::EncodeFailed(e.to_string()))?;

    Ok(EncodedFrame {
        data: Bytes::from(out),
        content_type: JPEG_CONTENT_TYPE,
    })
}
