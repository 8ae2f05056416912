use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NO_LOAD: u64 = u64::MAX;

/// Liveness signal published by a running unit.
///
/// The timestamp starts at a grace deadline in the future so a unit that is
/// still warming up is not reported stale.
#[derive(Debug)]
pub struct Heartbeat {
    last_ms: AtomicU64,
    load_bits: AtomicU64,
}

impl Heartbeat {
    pub fn new(grace: Duration) -> Self {
        let deadline = current_millis().saturating_add(grace.as_millis() as u64);
        Self {
            last_ms: AtomicU64::new(deadline),
            load_bits: AtomicU64::new(NO_LOAD),
        }
    }

    pub fn beat(&self) {
        self.last_ms.store(current_millis(), Ordering::Relaxed);
    }

    /// Beat and publish a load fraction alongside.
    pub fn beat_with_load(&self, load: f64) {
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);
        self.beat();
    }

    pub fn last_beat_ms(&self) -> u64 {
        self.last_ms.load(Ordering::Relaxed)
    }

    pub fn load(&self) -> Option<f64> {
        match self.load_bits.load(Ordering::Relaxed) {
            NO_LOAD => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// Milliseconds since the last beat, zero while still inside the grace period.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_beat_ms())
    }

    pub fn is_stale(&self, now_ms: u64, timeout: Duration) -> bool {
        self.age_ms(now_ms) > timeout.as_millis() as u64
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_period_defers_staleness() {
        let beat = Heartbeat::new(Duration::from_secs(60));
        let now = current_millis();
        assert_eq!(beat.age_ms(now), 0);
        assert!(!beat.is_stale(now + 30_000, Duration::from_secs(10)));
        assert!(beat.is_stale(now + 80_000, Duration::from_secs(10)));
    }

    #[test]
    fn load_is_published_with_beat() {
        let beat = Heartbeat::new(Duration::ZERO);
        assert_eq!(beat.load(), None);
        beat.beat_with_load(0.25);
        assert_eq!(beat.load(), Some(0.25));
    }
}
