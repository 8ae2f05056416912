//! Operator-facing notifications and control.
//!
//! Units publish `Notice`s on one unbounded channel. A single
//! `NotificationWorker` fans them out to the configured sinks (log,
//! snapshot files, MQTT). Control flows the other way as `Command`s, applied
//! by the `CommandHandler`, which is the only writer of armed flags.

mod alarm;
mod command;
#[cfg(feature = "notify-mqtt")]
mod mqtt;
mod sinks;

pub use alarm::{AlarmEscalator, AlarmRelay, LogRelay};
#[cfg(feature = "alarm-relay")]
pub use alarm::HttpRelay;
pub use command::{ArmTarget, Command, CommandHandler, CommandWorker};
#[cfg(feature = "notify-mqtt")]
pub use mqtt::{MqttSettings, MqttSink};
pub use sinks::{LogSink, SnapshotSink};

use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::camera::CameraId;
use crate::error::FailureKind;
use crate::frame::Frame;
use crate::supervisor::{Task, TaskContext};

const POLL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub enum Notice {
    /// A frame worth showing someone, usually annotated.
    Snapshot {
        camera: CameraId,
        frame: Frame,
        caption: String,
    },
    /// A camera's record flag went up.
    AlarmRaised { camera: CameraId },
    /// A camera's record flag came down.
    AlarmCleared { camera: CameraId },
    /// The system alarm is set and will fire unless cancelled.
    AlarmPending { grace: Duration },
    AlarmTriggered,
    AlarmCancelled,
    /// Relay could not be switched on.
    RelayFailed { message: String },
    /// `None` is the system-wide flag.
    ArmedChanged {
        camera: Option<CameraId>,
        armed: bool,
    },
    UnitFailed {
        unit: String,
        kind: FailureKind,
        message: String,
        stalled: bool,
    },
}

impl Notice {
    /// Short human-readable line, used by the log sink and MQTT payloads.
    pub fn summary(&self) -> String {
        match self {
            Notice::Snapshot { caption, .. } => caption.clone(),
            Notice::AlarmRaised { camera } => format!("activity on camera {camera}"),
            Notice::AlarmCleared { camera } => format!("activity over on camera {camera}"),
            Notice::AlarmPending { grace } => {
                format!("alarm will trigger in {}s", grace.as_secs())
            }
            Notice::AlarmTriggered => "alarm triggered".to_string(),
            Notice::AlarmCancelled => "alarm cancelled".to_string(),
            Notice::RelayFailed { message } => format!("error triggering alarm: {message}"),
            Notice::ArmedChanged { camera: None, armed } => {
                format!("system {}", if *armed { "armed" } else { "disarmed" })
            }
            Notice::ArmedChanged {
                camera: Some(camera),
                armed,
            } => format!(
                "camera {camera} {}",
                if *armed { "armed" } else { "disarmed" }
            ),
            Notice::UnitFailed {
                unit,
                kind,
                message,
                stalled,
            } => {
                if *stalled {
                    format!("unit {unit} stalled: {message}")
                } else {
                    format!("unit {unit} failed ({}): {message}", kind.label())
                }
            }
        }
    }

    /// Camera the notice is about, if any.
    pub fn camera(&self) -> Option<CameraId> {
        match self {
            Notice::Snapshot { camera, .. }
            | Notice::AlarmRaised { camera }
            | Notice::AlarmCleared { camera } => Some(*camera),
            Notice::ArmedChanged { camera, .. } => *camera,
            _ => None,
        }
    }
}

/// Somewhere notices end up.
pub trait NotificationSink: Send {
    fn name(&self) -> &str;

    fn deliver(&mut self, notice: &Notice) -> Result<()>;
}

/// Drains the notice channel into every sink. A failing sink is logged and
/// skipped; it never blocks the others.
pub struct NotificationWorker {
    notices: Receiver<Notice>,
    sinks: Vec<Box<dyn NotificationSink>>,
    delivered: u64,
}

impl NotificationWorker {
    pub fn new(notices: Receiver<Notice>, sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self {
            notices,
            sinks,
            delivered: 0,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dispatch(&mut self, notice: &Notice) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.deliver(notice) {
                log::warn!("notify: sink {} failed: {err:#}", sink.name());
            }
        }
        self.delivered += 1;
    }

    /// Deliver everything already queued without blocking.
    pub fn drain(&mut self) -> usize {
        let pending: Vec<Notice> = self.notices.try_iter().collect();
        for notice in &pending {
            self.dispatch(notice);
        }
        pending.len()
    }
}

impl Task for NotificationWorker {
    fn name(&self) -> &str {
        "notify"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        while !ctx.should_stop() {
            match self.notices.recv_timeout(POLL) {
                Ok(notice) => self.dispatch(&notice),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("notice channel closed"))
                }
            }
            ctx.beat();
        }
        Ok(())
    }
}
