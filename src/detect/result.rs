use crate::frame::PixelRect;

/// Axis-aligned box in pixel coordinates of the frame it was found in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Anchor used for region tests: where the object touches the ground.
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    /// Grow by `fraction` of the box size on every side, clamped to a
    /// `width`x`height` frame. `None` if nothing of the box is left.
    pub fn padded(&self, fraction: f32, width: u32, height: u32) -> Option<PixelRect> {
        let dx = self.width() * fraction;
        let dy = self.height() * fraction;
        let x1 = (self.x1 - dx).max(0.0) as u32;
        let y1 = (self.y1 - dy).max(0.0) as u32;
        let x2 = ((self.x2 + dx).min(width as f32)).max(0.0) as u32;
        let y2 = ((self.y2 + dy).min(height as f32)).max(0.0) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(PixelRect {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_id: u32, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_thirty_percent_and_clamped() {
        let bbox = BoundingBox::new(10.0, 10.0, 20.0, 30.0);
        assert_eq!(
            bbox.padded(0.3, 100, 100),
            Some(PixelRect {
                x: 7,
                y: 4,
                width: 16,
                height: 32
            })
        );

        let edge = BoundingBox::new(0.0, 90.0, 10.0, 100.0);
        assert_eq!(
            edge.padded(0.3, 100, 100),
            Some(PixelRect {
                x: 0,
                y: 87,
                width: 13,
                height: 13
            })
        );
    }

    #[test]
    fn bottom_center_anchor() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 8.0);
        assert_eq!(bbox.bottom_center(), (5.0, 8.0));
    }
}
