//! Record-counter hysteresis.
//!
//! Each cycle with at least one verified detection moves the counter up, any
//! other cycle moves it down, within `[0, 2 * threshold]`. Reaching the
//! threshold raises the record flag; the flag only drops again once the
//! counter has decayed to 1 and another empty cycle is observed.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    Raised,
    Cleared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterStep {
    pub value: u32,
    pub transition: Transition,
    /// Counter is elevated but has not triggered yet; worth a second look
    /// before the next cycle.
    pub recheck: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct RecordCounter {
    threshold: u32,
}

impl RecordCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn ceiling(&self) -> u32 {
        self.threshold * 2
    }

    /// Apply one observation. `flag` is the record flag before this step.
    pub fn step(&self, current: u32, detections: usize, flag: bool) -> CounterStep {
        let value = if detections > 0 {
            current.saturating_add(1)
        } else {
            current.saturating_sub(1)
        }
        .min(self.ceiling());

        let transition = if value >= self.threshold && !flag {
            Transition::Raised
        } else if value == 1 && detections == 0 && flag {
            Transition::Cleared
        } else {
            Transition::None
        };

        CounterStep {
            value,
            transition,
            recheck: value > 0 && value < self.threshold && !flag,
        }
    }
}
