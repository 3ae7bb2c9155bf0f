use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};

use crate::frame::RawFrame;

/// Image codec seam between the byte-oriented and pixel-oriented stages.
pub trait FrameCodec: Send + Sync + 'static {
    /// `Ok(None)` means the payload held no usable image; the caller drops it.
    fn decode(&self, data: &[u8]) -> Result<Option<RawFrame>, CodecError>;

    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("frame buffer holds {got} bytes, {width}x{height} needs {expected}")]
    BadBuffer {
        width: u32,
        height: u32,
        got: usize,
        expected: usize,
    },
}

/// Baseline JPEG via the `image` crate.
#[derive(Debug, Clone)]
pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new(80)
    }
}

impl FrameCodec for JpegCodec {
    fn decode(&self, data: &[u8]) -> Result<Option<RawFrame>, CodecError> {
        if data.is_empty() {
            return Ok(None);
        }
        let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(|e| CodecError::Decode(e.to_string()))?
            .into_rgb8();
        let (width, height) = img.dimensions();
        let frame = RawFrame::new(width, height, img.into_raw());
        if frame.is_empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, CodecError> {
        let expected = RawFrame::expected_len(frame.width, frame.height);
        if frame.is_empty() {
            return Err(CodecError::BadBuffer {
                width: frame.width,
                height: frame.height,
                got: frame.data.len(),
                expected,
            });
        }
        let mut out = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }
}
