use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::{passes_filter, DetectionCapability, DetectorBackend};
use crate::detect::result::Detection;
use crate::frame::Frame;

#[derive(Default)]
struct Script {
    queued: VecDeque<Result<Vec<Detection>, String>>,
    fallback: Vec<Detection>,
    latency: Duration,
}

/// Scripted backend for tests and dry runs.
///
/// Each call pops the next queued outcome, or returns the fallback (no
/// detections unless set) once the queue is empty. Behaviour is driven
/// through a `StubControl` that stays usable after the backend has been
/// moved into a registry.
pub struct StubBackend {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicU64>,
}

/// Remote control for a `StubBackend`.
#[derive(Clone)]
pub struct StubControl {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicU64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn control(&self) -> StubControl {
        StubControl {
            script: self.script.clone(),
            calls: self.calls.clone(),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StubControl {
    pub fn push(&self, detections: Vec<Detection>) {
        if let Ok(mut script) = self.script.lock() {
            script.queued.push_back(Ok(detections));
        }
    }

    pub fn push_failure(&self, message: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.queued.push_back(Err(message.to_string()));
        }
    }

    /// Result returned whenever the queue is empty.
    pub fn set_fallback(&self, detections: Vec<Detection>) {
        if let Ok(mut script) = self.script.lock() {
            script.fallback = detections;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut script) = self.script.lock() {
            script.latency = latency;
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(
            capability,
            DetectionCapability::ObjectDetection | DetectionCapability::CropReverify
        )
    }

    fn detect(&mut self, _frame: &Frame, classes: &[u32], confidence: f32) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (outcome, latency) = {
            let mut script = self
                .script
                .lock()
                .map_err(|_| anyhow!("stub script lock poisoned"))?;
            let outcome = match script.queued.pop_front() {
                Some(outcome) => outcome,
                None => Ok(script.fallback.clone()),
            };
            (outcome, script.latency)
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let detections = outcome.map_err(|message| anyhow!("stub backend: {message}"))?;
        Ok(detections
            .into_iter()
            .filter(|d| passes_filter(d, classes, confidence))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;
    use crate::frame::FrameShape;

    #[test]
    fn replays_script_then_fallback() -> Result<()> {
        let mut backend = StubBackend::new();
        let control = backend.control();
        let frame = Frame::filled(FrameShape::rgb8(4, 4), 0)?;
        let person = Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 0, 0.9);
        let cat = Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 15, 0.9);

        control.push(vec![person.clone(), cat]);
        control.push_failure("device lost");
        assert_eq!(backend.detect(&frame, &[0], 0.5)?, vec![person]);
        assert!(backend.detect(&frame, &[0], 0.5).is_err());
        assert!(backend.detect(&frame, &[0], 0.5)?.is_empty());
        assert_eq!(control.calls(), 3);
        Ok(())
    }
}
