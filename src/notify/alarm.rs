use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Sender;

use super::Notice;
use crate::camera::SharedState;

/// Whatever makes noise once an alarm goes off.
pub trait AlarmRelay: Send {
    fn describe(&self) -> String;

    fn trigger(&mut self) -> Result<()>;
}

/// Relay stand-in when no hardware is configured.
#[derive(Default)]
pub struct LogRelay;

impl AlarmRelay for LogRelay {
    fn describe(&self) -> String {
        "log".to_string()
    }

    fn trigger(&mut self) -> Result<()> {
        log::warn!("alarm: triggered (no relay configured)");
        Ok(())
    }
}

/// Switches a networked relay on with a single GET.
#[cfg(feature = "alarm-relay")]
pub struct HttpRelay {
    url: String,
    timeout: Duration,
}

#[cfg(feature = "alarm-relay")]
impl HttpRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(feature = "alarm-relay")]
impl AlarmRelay for HttpRelay {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn trigger(&mut self) -> Result<()> {
        ureq::get(&self.url)
            .timeout(self.timeout)
            .call()
            .map_err(|err| anyhow::anyhow!("GET {}: {err}", self.url))?;
        Ok(())
    }
}

/// Turns a raised system alarm into a relay trigger unless someone cancels
/// it within the grace window.
pub struct AlarmEscalator {
    state: Arc<SharedState>,
    notices: Sender<Notice>,
    relay: Box<dyn AlarmRelay>,
    grace: Duration,
    pending_since: Option<Instant>,
}

impl AlarmEscalator {
    pub fn new(
        state: Arc<SharedState>,
        notices: Sender<Notice>,
        relay: Box<dyn AlarmRelay>,
        grace: Duration,
    ) -> Self {
        Self {
            state,
            notices,
            relay,
            grace,
            pending_since: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Advance the countdown. Returns true if the alarm fired on this call.
    pub fn poll(&mut self, now: Instant) -> bool {
        let raised = self.state.system().alarm();
        match (raised, self.pending_since) {
            (true, None) => {
                log::warn!("alarm: raised, triggering in {:?} unless cancelled", self.grace);
                self.pending_since = Some(now);
                self.publish(Notice::AlarmPending { grace: self.grace });
                if self.grace.is_zero() {
                    self.fire();
                    return true;
                }
                false
            }
            (true, Some(since)) if now.saturating_duration_since(since) >= self.grace => {
                self.fire();
                true
            }
            (false, Some(_)) => {
                self.pending_since = None;
                false
            }
            _ => false,
        }
    }

    /// Drop a raised alarm without triggering.
    pub fn cancel(&mut self) {
        self.pending_since = None;
        if self.state.system().clear_alarm() {
            log::info!("alarm: cancelled");
            self.publish(Notice::AlarmCancelled);
        } else {
            log::info!("alarm: cancel requested but none raised");
        }
    }

    /// Trigger right away, raised or not.
    pub fn confirm(&mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        self.pending_since = None;
        self.state.system().clear_alarm();
        log::warn!("alarm: triggering relay {}", self.relay.describe());
        match self.relay.trigger() {
            Ok(()) => self.publish(Notice::AlarmTriggered),
            Err(err) => {
                log::error!("alarm: relay failed: {err:#}");
                self.publish(Notice::RelayFailed {
                    message: format!("{err:#}"),
                });
            }
        }
    }

    fn publish(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}
