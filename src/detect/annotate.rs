//! Drawing regions and detection boxes onto frames.
//!
//! Only interleaved 8-bit RGB frames are drawn on; anything else is returned
//! unchanged.

use super::result::Detection;
use crate::camera::PixelPolygon;
use crate::frame::Frame;

const REGION_COLOR: [u8; 3] = [0, 200, 0];
const BOX_COLOR: [u8; 3] = [230, 40, 40];

pub fn annotate(frame: &Frame, region: &PixelPolygon, detections: &[Detection]) -> Frame {
    let mut out = frame.clone();
    if !out.shape().is_rgb8() {
        return out;
    }
    let mut canvas = Canvas::new(&mut out);

    let points = region.points();
    for (i, &(x0, y0)) in points.iter().enumerate() {
        let (x1, y1) = points[(i + 1) % points.len()];
        canvas.line(x0, y0, x1, y1, REGION_COLOR);
    }
    for detection in detections {
        let b = detection.bbox;
        canvas.line(b.x1, b.y1, b.x2, b.y1, BOX_COLOR);
        canvas.line(b.x2, b.y1, b.x2, b.y2, BOX_COLOR);
        canvas.line(b.x2, b.y2, b.x1, b.y2, BOX_COLOR);
        canvas.line(b.x1, b.y2, b.x1, b.y1, BOX_COLOR);
    }
    out
}

struct Canvas<'a> {
    width: i64,
    height: i64,
    pixels: &'a mut [u8],
}

impl<'a> Canvas<'a> {
    fn new(frame: &'a mut Frame) -> Self {
        let width = i64::from(frame.width());
        let height = i64::from(frame.height());
        Self {
            width,
            height,
            pixels: frame.bytes_mut(),
        }
    }

    fn put(&mut self, x: i64, y: i64, color: [u8; 3]) {
        let x = x.clamp(0, self.width - 1);
        let y = y.clamp(0, self.height - 1);
        let at = ((y * self.width + x) * 3) as usize;
        self.pixels[at..at + 3].copy_from_slice(&color);
    }

    /// Bresenham; endpoints are clamped into the frame.
    fn line(&mut self, x0: f32, y0: f32, x1: f32, y1: f32, color: [u8; 3]) {
        let (mut x, mut y) = (x0.round() as i64, y0.round() as i64);
        let (x1, y1) = (x1.round() as i64, y1.round() as i64);
        let dx = (x1 - x).abs();
        let dy = -(y1 - y).abs();
        let sx = if x < x1 { 1 } else { -1 };
        let sy = if y < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::RegionOfInterest;
    use crate::detect::result::BoundingBox;
    use crate::frame::{FrameShape, PixelDepth};

    #[test]
    fn draws_box_outline_only() {
        let frame = Frame::filled(FrameShape::rgb8(20, 20), 0).unwrap();
        let region = RegionOfInterest::full_frame().to_pixels(20, 20);
        let det = Detection::new(BoundingBox::new(5.0, 5.0, 10.0, 10.0), 0, 0.9);
        let out = annotate(&frame, &region, &[det]);
        let px = |x: usize, y: usize| &out.as_bytes()[(y * 20 + x) * 3..(y * 20 + x) * 3 + 3];
        assert_eq!(px(5, 5), &BOX_COLOR);
        assert_eq!(px(10, 7), &BOX_COLOR);
        assert_eq!(px(7, 7), &[0, 0, 0]);
        assert_eq!(px(0, 0), &REGION_COLOR);
    }

    #[test]
    fn non_rgb_frames_pass_through() {
        let frame = Frame::filled(FrameShape::new(4, 4, 1, PixelDepth::U8), 3).unwrap();
        let region = RegionOfInterest::full_frame().to_pixels(4, 4);
        assert_eq!(annotate(&frame, &region, &[]), frame);
    }
}
