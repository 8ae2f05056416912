use anyhow::Result;

use crate::camera::CameraId;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Optional behaviours a backend may offer.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    Motion,
    ObjectDetection,
    /// Re-running on a crop of a frame gives a meaningful answer.
    CropReverify,
}

/// Which stream a frame belongs to. Stateful backends keep one reference
/// per source so live and review frames of different cameras never mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Live(CameraId),
    Review(CameraId),
    Adhoc,
}

/// Detector backend trait.
///
/// Backends are called from the detection scheduler only, once per sampled
/// frame and once per drained review frame. Their latency dominates the
/// cycle cost.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Detections of the requested classes (empty filter = any class) at or
    /// above `confidence`, in pixel coordinates of `frame`.
    fn detect(&mut self, frame: &Frame, classes: &[u32], confidence: f32)
        -> Result<Vec<Detection>>;

    /// Detection on a frame from a known source. Stateless backends need not
    /// override this.
    fn detect_source(
        &mut self,
        source: SourceKey,
        frame: &Frame,
        classes: &[u32],
        confidence: f32,
    ) -> Result<Vec<Detection>> {
        let _ = source;
        self.detect(frame, classes, confidence)
    }

    /// Label for a class id, used in annotations and captions.
    fn class_name(&self, class_id: u32) -> String {
        format!("class {class_id}")
    }

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared filter used by backends: class and confidence gate.
pub(crate) fn passes_filter(detection: &Detection, classes: &[u32], confidence: f32) -> bool {
    detection.confidence >= confidence
        && (classes.is_empty() || classes.contains(&detection.class_id))
}
