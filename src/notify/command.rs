use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::alarm::AlarmEscalator;
use super::Notice;
use crate::camera::{CameraId, SharedState};
use crate::state_store::{ArmedState, StateStore};
use crate::supervisor::{Task, TaskContext};

const POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmTarget {
    System,
    Camera(CameraId),
    /// The system flag and every camera.
    All,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Arm(ArmTarget),
    Disarm(ArmTarget),
    CancelAlarm,
    ConfirmAlarm,
    Snapshot(CameraId),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Arm(target) => write!(f, "arm {target:?}"),
            Command::Disarm(target) => write!(f, "disarm {target:?}"),
            Command::CancelAlarm => f.write_str("cancel alarm"),
            Command::ConfirmAlarm => f.write_str("confirm alarm"),
            Command::Snapshot(camera) => write!(f, "snapshot of camera {camera}"),
        }
    }
}

/// Applies arm/disarm and snapshot commands. Sole writer of the armed flags.
pub struct CommandHandler {
    state: Arc<SharedState>,
    store: Box<dyn StateStore>,
    notices: Sender<Notice>,
}

impl CommandHandler {
    pub fn new(state: Arc<SharedState>, store: Box<dyn StateStore>, notices: Sender<Notice>) -> Self {
        Self {
            state,
            store,
            notices,
        }
    }

    /// Apply persisted flags on top of the configured defaults.
    pub fn restore(&mut self) -> Result<ArmedState> {
        let stored = self.store.load_state().context("load armed state")?;
        stored.apply(&self.state);
        log::info!(
            "state: system {}, {} of {} cameras armed",
            if self.state.system().is_armed() { "armed" } else { "disarmed" },
            self.state.cameras().iter().filter(|c| c.is_armed()).count(),
            self.state.cameras().len()
        );
        Ok(stored)
    }

    pub fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Arm(target) => self.set_armed(*target, true),
            Command::Disarm(target) => self.set_armed(*target, false),
            Command::Snapshot(id) => self.snapshot(*id),
            Command::CancelAlarm | Command::ConfirmAlarm => {
                Err(anyhow!("{command} is handled by the alarm escalator"))
            }
        }
    }

    fn set_armed(&mut self, target: ArmTarget, armed: bool) -> Result<()> {
        let mut changed = Vec::new();
        if matches!(target, ArmTarget::System | ArmTarget::All) {
            let system = self.state.system();
            if system.is_armed() != armed {
                system.set_armed(armed);
                changed.push(None);
            }
        }
        match target {
            ArmTarget::Camera(id) => {
                let camera = self
                    .state
                    .camera(id)
                    .ok_or_else(|| anyhow!("unknown camera {id}"))?;
                if camera.is_armed() != armed {
                    camera.set_armed(armed);
                    changed.push(Some(id));
                }
            }
            ArmTarget::All => {
                for camera in self.state.cameras() {
                    if camera.is_armed() != armed {
                        camera.set_armed(armed);
                        changed.push(Some(camera.id()));
                    }
                }
            }
            ArmTarget::System => {}
        }

        for camera in &changed {
            log::info!(
                "state: {} {}",
                camera.map_or_else(|| "system".to_string(), |id| format!("camera {id}")),
                if armed { "armed" } else { "disarmed" }
            );
            let _ = self.notices.send(Notice::ArmedChanged {
                camera: *camera,
                armed,
            });
        }
        if !changed.is_empty() {
            self.store
                .save_state(&ArmedState::capture(&self.state))
                .context("persist armed state")?;
        }
        Ok(())
    }

    fn snapshot(&mut self, id: CameraId) -> Result<()> {
        let camera = self
            .state
            .camera(id)
            .ok_or_else(|| anyhow!("unknown camera {id}"))?;
        let frame = camera
            .buffer()
            .latest()
            .with_context(|| format!("no frame from camera {id} yet"))?;
        let _ = self.notices.send(Notice::Snapshot {
            camera: id,
            frame,
            caption: format!("Snapshot of camera {}", camera.settings().name),
        });
        Ok(())
    }
}

/// The control unit: applies commands as they arrive and runs the alarm
/// countdown in between.
pub struct CommandWorker {
    commands: Receiver<Command>,
    handler: CommandHandler,
    escalator: AlarmEscalator,
}

impl CommandWorker {
    pub fn new(commands: Receiver<Command>, handler: CommandHandler, escalator: AlarmEscalator) -> Self {
        Self {
            commands,
            handler,
            escalator,
        }
    }

    /// A bad command is logged and dropped; it never takes the unit down.
    pub fn handle(&mut self, command: &Command) {
        log::debug!("control: {command}");
        let outcome = match command {
            Command::CancelAlarm => {
                self.escalator.cancel();
                Ok(())
            }
            Command::ConfirmAlarm => {
                self.escalator.confirm();
                Ok(())
            }
            other => self.handler.apply(other),
        };
        if let Err(err) = outcome {
            log::warn!("control: {command} failed: {err:#}");
        }
    }

    pub fn escalator(&self) -> &AlarmEscalator {
        &self.escalator
    }
}

impl Task for CommandWorker {
    fn name(&self) -> &str {
        "control"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        while !ctx.should_stop() {
            match self.commands.recv_timeout(POLL) {
                Ok(command) => self.handle(&command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("command channel closed"))
                }
            }
            self.escalator.poll(Instant::now());
            ctx.beat();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSettings, CameraState};
    use crate::frame::{Frame, FrameShape};
    use crate::notify::LogRelay;
    use crate::state_store::InMemoryStateStore;
    use std::sync::Mutex;

    /// Shares its contents with the test after being boxed into a handler.
    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<InMemoryStateStore>>);

    impl StateStore for SharedStore {
        fn load_state(&mut self) -> Result<ArmedState> {
            self.0.lock().unwrap().load_state()
        }

        fn save_state(&mut self, state: &ArmedState) -> Result<()> {
            self.0.lock().unwrap().save_state(state)
        }
    }

    fn state() -> Arc<SharedState> {
        let shape = FrameShape::rgb8(4, 4);
        let cameras = vec![
            CameraState::new(CameraSettings::new(1, "stub://a", shape), 2).unwrap(),
            CameraState::new(CameraSettings::new(2, "stub://b", shape), 2).unwrap(),
        ];
        Arc::new(SharedState::new(true, cameras).unwrap())
    }

    #[test]
    fn disarm_all_persists_and_notifies() -> Result<()> {
        let state = state();
        let store = SharedStore::default();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handler = CommandHandler::new(state.clone(), Box::new(store.clone()), tx);

        handler.apply(&Command::Disarm(ArmTarget::All))?;
        assert!(!state.system().is_armed());
        assert!(state.cameras().iter().all(|c| !c.is_armed()));
        assert_eq!(rx.try_iter().count(), 3);

        let saved = store.clone().load_state()?;
        assert_eq!(saved.system, Some(false));
        assert_eq!(saved.cameras.get(&CameraId(2)), Some(&false));

        // Already disarmed: nothing to announce.
        handler.apply(&Command::Disarm(ArmTarget::Camera(CameraId(1))))?;
        assert_eq!(rx.try_iter().count(), 0);
        Ok(())
    }

    #[test]
    fn restore_applies_stored_flags() -> Result<()> {
        let state = state();
        let mut store = SharedStore::default();
        store.save_state(&ArmedState {
            system: Some(false),
            cameras: [(CameraId(2), false)].into_iter().collect(),
        })?;
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut handler = CommandHandler::new(state.clone(), Box::new(store), tx);
        handler.restore()?;
        assert!(!state.system().is_armed());
        assert!(state.camera(CameraId(1)).unwrap().is_armed());
        assert!(!state.camera(CameraId(2)).unwrap().is_armed());
        Ok(())
    }

    #[test]
    fn snapshot_and_unknown_camera() -> Result<()> {
        let state = state();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handler = CommandHandler::new(state.clone(), Box::new(InMemoryStateStore::new()), tx.clone());
        assert!(handler.apply(&Command::Snapshot(CameraId(1))).is_err());

        let camera = state.camera(CameraId(1)).unwrap();
        camera.buffer().append(&Frame::filled(camera.settings().shape, 3)?)?;
        handler.apply(&Command::Snapshot(CameraId(1)))?;
        assert!(matches!(rx.try_recv()?, Notice::Snapshot { camera: CameraId(1), .. }));

        // The recorder draining the ring does not make the camera unreachable.
        camera.buffer().pop_oldest()?;
        handler.apply(&Command::Snapshot(CameraId(1)))?;
        assert!(matches!(
            rx.try_recv()?,
            Notice::Snapshot { camera: CameraId(1), frame, .. } if frame.as_bytes()[0] == 3
        ));

        assert!(handler.apply(&Command::Arm(ArmTarget::Camera(CameraId(9)))).is_err());

        let escalator = AlarmEscalator::new(state.clone(), tx, Box::new(LogRelay), Duration::from_secs(30));
        let (_cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let mut worker = CommandWorker::new(cmd_rx, handler, escalator);
        state.system().raise_alarm();
        worker.handle(&Command::CancelAlarm);
        assert!(!state.system().alarm());
        Ok(())
    }
}
