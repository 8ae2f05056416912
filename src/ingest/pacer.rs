use std::time::{Duration, Instant};

/// Drift-compensating pacer.
///
/// Converts a source's irregular frame arrivals into a fixed target rate by
/// accumulating fractional "missed" target frames and emitting the integer
/// part as copies of the frame that just arrived.
#[derive(Debug)]
pub struct FramePacer {
    target_fps: f64,
    max_copies: usize,
    missed: f64,
    last: Option<Instant>,
}

impl FramePacer {
    /// `max_copies` caps one emission; typically the ring buffer capacity.
    pub fn new(target_fps: u32, max_copies: usize) -> Self {
        Self {
            target_fps: f64::from(target_fps.max(1)),
            max_copies: max_copies.max(1),
            missed: 0.0,
            last: None,
        }
    }

    pub fn target_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps)
    }

    /// Start counting from `at`, forgetting any accumulated debt.
    pub fn reset(&mut self, at: Instant) {
        self.missed = 0.0;
        self.last = Some(at);
    }

    /// Number of copies of a frame that arrived at `at`.
    pub fn copies(&mut self, at: Instant) -> usize {
        let elapsed = match self.last {
            Some(prev) => at.saturating_duration_since(prev),
            None => Duration::ZERO,
        };
        self.last = Some(at);
        self.missed += elapsed.as_secs_f64() * self.target_fps;
        let whole = self.missed.floor();
        self.missed -= whole;
        // Anything beyond one buffer's worth would only overwrite itself.
        (whole as usize).min(self.max_copies)
    }
}
