//! Time accounting for the detection cycle.

use std::time::Duration;

/// Weight of history in both moving averages (new sample weight is 1/20).
const HISTORY: f64 = 19.0;
const WINDOW: f64 = 20.0;

/// Share of the left-over cycle time spent on file review; the rest is
/// slack for the next cycle's live work.
pub const DRAIN_MARGIN: f64 = 0.65;

/// Moving average of one inference's wall time.
#[derive(Clone, Copy, Debug)]
pub struct InferenceTimer {
    average: f64,
}

impl InferenceTimer {
    pub fn new(initial: Duration) -> Self {
        Self {
            average: initial.as_secs_f64(),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.average = (self.average * HISTORY + sample.as_secs_f64()) / WINDOW;
    }

    pub fn average(&self) -> Duration {
        Duration::from_secs_f64(self.average.max(0.0))
    }

    pub fn average_secs(&self) -> f64 {
        self.average
    }
}

/// Review inferences that fit into `time_left` seconds.
pub fn drain_budget(time_left: f64, average: f64) -> usize {
    if time_left <= 0.0 || average <= 0.0 {
        return 0;
    }
    (time_left * DRAIN_MARGIN / average).floor() as usize
}

/// Smoothed share of the cycle that was busy. Exceeds 1.0 while the
/// scheduler is oversubscribed.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadMeter {
    value: f64,
}

impl LoadMeter {
    /// `time_left` may be negative when the cycle overran.
    pub fn update(&mut self, time_left: f64, cycle: f64) -> f64 {
        let utilization = 1.0 - time_left / cycle;
        self.value = (self.value * HISTORY + utilization) / WINDOW;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
