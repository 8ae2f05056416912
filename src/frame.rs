//! Fixed-shape raster frames.
//!
//! Every camera produces frames of one shape (height, width, channels, byte
//! depth) fixed at configuration time. A `Frame` owns its bytes and is never
//! mutated after it has been handed to a ring buffer.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per channel sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelDepth {
    U8,
    U16,
}

impl PixelDepth {
    pub fn bytes(self) -> usize {
        match self {
            PixelDepth::U8 => 1,
            PixelDepth::U16 => 2,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            PixelDepth::U8 => 1,
            PixelDepth::U16 => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PixelDepth::U8),
            2 => Some(PixelDepth::U16),
            _ => None,
        }
    }
}

/// Shape and byte layout of a frame. Two frames are interchangeable in a
/// ring buffer only when their shapes compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u8,
    pub depth: PixelDepth,
}

impl FrameShape {
    pub fn new(height: u32, width: u32, channels: u8, depth: PixelDepth) -> Self {
        Self {
            height,
            width,
            channels,
            depth,
        }
    }

    /// Interleaved 8-bit RGB.
    pub fn rgb8(width: u32, height: u32) -> Self {
        Self::new(height, width, 3, PixelDepth::U8)
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0 || self.channels == 0
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.channels as usize * self.depth.bytes()
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel()
    }

    /// Size of one frame payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.height as usize * self.row_bytes()
    }

    pub fn is_rgb8(&self) -> bool {
        self.channels == 3 && self.depth == PixelDepth::U8
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} {:?}",
            self.height, self.width, self.channels, self.depth
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shape {0} has a zero dimension")]
    EmptyShape(FrameShape),
    #[error("frame payload is {found} bytes, shape {shape} needs {expected}")]
    LengthMismatch {
        shape: FrameShape,
        expected: usize,
        found: usize,
    },
    #[error("crop {x},{y} {width}x{height} falls outside a {shape} frame")]
    CropOutOfBounds {
        shape: FrameShape,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}

/// Axis-aligned pixel rectangle, `x`/`y` is the top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// An immutable raster with a known shape. Equality compares shape and
/// pixels, not capture time.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    shape: FrameShape,
    captured_at: Instant,
}

impl Frame {
    pub fn new(shape: FrameShape, data: Vec<u8>) -> Result<Self, FrameError> {
        if shape.is_empty() {
            return Err(FrameError::EmptyShape(shape));
        }
        let expected = shape.byte_len();
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                shape,
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            data,
            shape,
            captured_at: Instant::now(),
        })
    }

    /// Build a frame whose payload length is already known to match.
    pub(crate) fn from_trusted(shape: FrameShape, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), shape.byte_len());
        Self {
            data,
            shape,
            captured_at: Instant::now(),
        }
    }

    /// A frame with every byte set to `value`.
    pub fn filled(shape: FrameShape, value: u8) -> Result<Self, FrameError> {
        Self::new(shape, vec![value; shape.byte_len()])
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Monotonic instant the frame was constructed (capture or copy-out).
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Copy out a sub-rectangle as a new frame of the same channel layout.
    pub fn crop(&self, rect: PixelRect) -> Result<Frame, FrameError> {
        let out_of_bounds = rect.width == 0
            || rect.height == 0
            || rect.x.saturating_add(rect.width) > self.shape.width
            || rect.y.saturating_add(rect.height) > self.shape.height;
        if out_of_bounds {
            return Err(FrameError::CropOutOfBounds {
                shape: self.shape,
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
            });
        }

        let bpp = self.shape.bytes_per_pixel();
        let src_row = self.shape.row_bytes();
        let dst_row = rect.width as usize * bpp;
        let mut data = Vec::with_capacity(dst_row * rect.height as usize);
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * src_row + rect.x as usize * bpp;
            data.extend_from_slice(&self.data[start..start + dst_row]);
        }
        let shape = FrameShape {
            height: rect.height,
            width: rect.width,
            ..self.shape
        };
        Frame::new(shape, data)
    }

    /// Mutable access for annotation. Only used on frames that have not been
    /// shared yet.
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_accounts_for_depth() {
        let shape = FrameShape::new(4, 5, 3, PixelDepth::U16);
        assert_eq!(shape.byte_len(), 4 * 5 * 3 * 2);
    }

    #[test]
    fn rejects_wrong_payload_length() {
        let shape = FrameShape::rgb8(2, 2);
        let err = Frame::new(shape, vec![0; 11]).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                shape,
                expected: 12,
                found: 11
            }
        );
    }

    #[test]
    fn crop_copies_rows() {
        let shape = FrameShape::new(3, 3, 1, PixelDepth::U8);
        let frame = Frame::new(shape, (0u8..9).collect()).unwrap();
        let crop = frame
            .crop(PixelRect {
                x: 1,
                y: 1,
                width: 2,
                height: 2,
            })
            .unwrap();
        assert_eq!(crop.as_bytes(), &[4, 5, 7, 8]);
        assert_eq!(crop.width(), 2);
    }

    #[test]
    fn crop_outside_frame_fails() {
        let frame = Frame::filled(FrameShape::rgb8(4, 4), 0).unwrap();
        assert!(frame
            .crop(PixelRect {
                x: 3,
                y: 0,
                width: 2,
                height: 1
            })
            .is_err());
    }
}
