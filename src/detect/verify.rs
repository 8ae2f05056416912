//! Region filtering and zoom-and-reverify.

use anyhow::Result;

use super::backend::{DetectionCapability, DetectorBackend, SourceKey};
use super::result::Detection;
use crate::camera::{CameraSettings, PixelPolygon};
use crate::frame::Frame;

/// Each side of a candidate box grows by this fraction before re-checking.
pub const REVERIFY_PADDING: f32 = 0.3;

/// Keep detections whose bottom-center anchor lies inside `region`.
pub fn in_region(detections: Vec<Detection>, region: &PixelPolygon) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| {
            let (x, y) = d.bbox.bottom_center();
            region.contains(x, y)
        })
        .collect()
}

/// Re-run detection on a padded crop around every candidate and keep the
/// candidates for which the crop still yields something.
pub fn reverify(
    backend: &mut dyn DetectorBackend,
    frame: &Frame,
    candidates: Vec<Detection>,
    classes: &[u32],
    confidence: f32,
) -> Result<Vec<Detection>> {
    let mut verified = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Some(rect) = candidate
            .bbox
            .padded(REVERIFY_PADDING, frame.width(), frame.height())
        else {
            continue;
        };
        let crop = frame.crop(rect)?;
        if !backend.detect(&crop, classes, confidence)?.is_empty() {
            verified.push(candidate);
        }
    }
    Ok(verified)
}

/// Full per-frame inspection: detect, restrict to the camera's region and,
/// when asked and supported, reverify each survivor.
pub fn inspect(
    backend: &mut dyn DetectorBackend,
    source: SourceKey,
    frame: &Frame,
    camera: &CameraSettings,
    double_check: bool,
) -> Result<Vec<Detection>> {
    let found = backend.detect_source(source, frame, &camera.class_filter, camera.confidence)?;
    if found.is_empty() {
        return Ok(found);
    }
    let region = camera.region.to_pixels(frame.width(), frame.height());
    let zoned = in_region(found, &region);
    if zoned.is_empty() || !double_check || !backend.supports(DetectionCapability::CropReverify) {
        return Ok(zoned);
    }
    reverify(backend, frame, zoned, &camera.class_filter, camera.confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::RegionOfInterest;
    use crate::detect::backends::StubBackend;
    use crate::detect::result::BoundingBox;
    use crate::frame::FrameShape;

    fn person(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), 0, 0.9)
    }

    #[test]
    fn region_uses_bottom_center() {
        let left_half = RegionOfInterest::new(vec![(0.0, 0.0), (0.5, 0.0), (0.5, 1.0), (0.0, 1.0)])
            .unwrap()
            .to_pixels(100, 100);
        let kept = in_region(
            vec![person(10.0, 10.0, 30.0, 40.0), person(40.0, 10.0, 90.0, 40.0)],
            &left_half,
        );
        assert_eq!(kept, vec![person(10.0, 10.0, 30.0, 40.0)]);
    }

    #[test]
    fn reverify_drops_unconfirmed_candidates() -> Result<()> {
        let mut backend = StubBackend::new();
        let control = backend.control();
        let frame = Frame::filled(FrameShape::rgb8(100, 100), 0)?;
        control.push(vec![person(1.0, 1.0, 5.0, 5.0)]);
        control.push(vec![]);
        let kept = reverify(
            &mut backend,
            &frame,
            vec![person(10.0, 10.0, 30.0, 40.0), person(50.0, 50.0, 60.0, 60.0)],
            &[0],
            0.5,
        )?;
        assert_eq!(kept, vec![person(10.0, 10.0, 30.0, 40.0)]);
        assert_eq!(control.calls(), 2);
        Ok(())
    }

    #[test]
    fn inspect_skips_reverify_when_disabled() -> Result<()> {
        let mut backend = StubBackend::new();
        let control = backend.control();
        let frame = Frame::filled(FrameShape::rgb8(100, 100), 0)?;
        let settings = CameraSettings::new(1, "stub://", frame.shape());
        control.push(vec![person(10.0, 10.0, 30.0, 40.0)]);
        let found = inspect(&mut backend, SourceKey::Live(settings.id), &frame, &settings, false)?;
        assert_eq!(found.len(), 1);
        assert_eq!(control.calls(), 1);
        Ok(())
    }
}
