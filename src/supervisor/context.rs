use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::heartbeat::Heartbeat;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// A restartable unit of work.
///
/// `run` is expected to loop until `ctx.should_stop()` or an error. Returning
/// either way hands control back to the supervisor, which builds a fresh task
/// after the backoff.
pub trait Task: Send {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &TaskContext) -> Result<()>;
}

/// What a running task sees of its supervisor.
#[derive(Clone)]
pub struct TaskContext {
    heartbeat: Arc<Heartbeat>,
    cancel: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(heartbeat: Arc<Heartbeat>, cancel: Arc<AtomicBool>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            heartbeat,
            cancel,
            shutdown,
        }
    }

    /// A context nobody will ever cancel. Handy for driving a task by hand.
    pub fn detached() -> Self {
        Self::new(
            Arc::new(Heartbeat::new(Duration::ZERO)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// True once this generation was abandoned or the process is shutting down.
    pub fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || self.shutdown.load(Ordering::Relaxed)
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn beat(&self) {
        self.heartbeat.beat();
    }

    /// Sleep in short slices, beating as it goes. Returns false if the task
    /// should stop instead of continuing.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return false;
            }
            self.heartbeat.beat();
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}
