use bytes::Bytes;

/// Bytes per pixel of the packed RGB24 layout every stage works in.
pub const BYTES_PER_PIXEL: usize = 3;

/// A decoded image: packed RGB24, row-major, no padding.
///
/// A frame has a single owner at any time. It moves between stages through a
/// [`crate::channel::FrameSender`]; the capture path clones it explicitly when
/// the same image is delivered to both the live and the recording channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// Wall-clock capture time (Unix millis), set by the capture loop.
    pub captured_at_ms: Option<i64>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
            captured_at_ms: None,
        }
    }

    /// A black frame of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0; Self::expected_len(width, height)])
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// True when the frame carries no pixels or its buffer does not match its
    /// dimensions. Such frames are dropped, never forwarded.
    pub fn is_empty(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.data.len() != Self::expected_len(self.width, self.height)
    }

    pub fn has_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Index of pixel (x, y) in `data`, or `None` outside the frame.
    pub fn pixel_offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let i = self.pixel_offset(x, y)?;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

/// One multipart section's image bytes, exactly as they appeared on the wire
/// between the part's header terminator and the next boundary token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub data: Bytes,
}

impl EncodedPayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
