//! Supervision of long-running units.
//!
//! Every ingestor, recorder, review stage and the detection scheduler runs as
//! an independent unit on its own thread. A unit that returns, fails or
//! panics is rebuilt from its factory after a fixed backoff. Watched units
//! must keep their heartbeat fresh; one that goes quiet past the stall
//! timeout is abandoned (its generation is cancelled and the thread
//! detached) and a fresh instance is started in its place. Failures never
//! cross unit boundaries.

mod context;
mod heartbeat;

pub use context::{Task, TaskContext};
pub use heartbeat::Heartbeat;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;

use crate::error::{FailureKind, PipelineError};
use crate::notify::Notice;
use heartbeat::current_millis;

pub type TaskFactory = Box<dyn FnMut() -> Result<Box<dyn Task>> + Send>;

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub restart_backoff: Duration,
    pub stall_timeout: Duration,
    pub poll_interval: Duration,
    pub report_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of one unit.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitReport {
    pub name: String,
    pub running: bool,
    pub generation: u64,
    pub restarts: u64,
    pub stalls: u64,
    pub heartbeat_age_ms: Option<u64>,
    pub load: Option<f64>,
    pub last_failure: Option<String>,
}

struct Running {
    handle: JoinHandle<Result<()>>,
    ctx: TaskContext,
}

struct Unit {
    name: String,
    watched: bool,
    factory: TaskFactory,
    running: Option<Running>,
    restart_at: Option<Instant>,
    generation: u64,
    restarts: u64,
    stalls: u64,
    last_failure: Option<String>,
}

impl Unit {
    fn report(&self, now_ms: u64) -> UnitReport {
        let heartbeat = self.running.as_ref().map(|r| r.ctx.heartbeat().clone());
        UnitReport {
            name: self.name.clone(),
            running: self.running.is_some(),
            generation: self.generation,
            restarts: self.restarts,
            stalls: self.stalls,
            heartbeat_age_ms: heartbeat.as_ref().map(|h| h.age_ms(now_ms)),
            load: heartbeat.as_ref().and_then(|h| h.load()),
            last_failure: self.last_failure.clone(),
        }
    }
}

pub struct Supervisor {
    settings: SupervisorSettings,
    units: Vec<Unit>,
    shutdown: Arc<AtomicBool>,
    reports: Arc<Mutex<Vec<UnitReport>>>,
    notices: Option<Sender<Notice>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            units: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            reports: Arc::new(Mutex::new(Vec::new())),
            notices: None,
        }
    }

    /// Failures and stalls are also published as notices.
    pub fn with_notices(mut self, notices: Sender<Notice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Register a unit. `watched` units are restarted when their heartbeat
    /// goes stale.
    pub fn add_unit<F>(&mut self, name: impl Into<String>, watched: bool, factory: F)
    where
        F: FnMut() -> Result<Box<dyn Task>> + Send + 'static,
    {
        self.units.push(Unit {
            name: name.into(),
            watched,
            factory: Box::new(factory),
            running: None,
            restart_at: Some(Instant::now()),
            generation: 0,
            restarts: 0,
            stalls: 0,
            last_failure: None,
        });
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name.clone()).collect()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run the monitor loop on the current thread until shutdown is requested.
    pub fn run(mut self) -> Result<()> {
        log::info!("supervisor: starting {} units", self.units.len());
        let mut next_report = Instant::now() + self.settings.report_interval;
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once();
            if Instant::now() >= next_report {
                self.log_report();
                next_report = Instant::now() + self.settings.report_interval;
            }
            thread::sleep(self.settings.poll_interval);
        }
        self.stop_all();
        Ok(())
    }

    /// Run the monitor loop on a background thread.
    pub fn spawn(self) -> Result<SupervisorHandle> {
        let shutdown = self.shutdown.clone();
        let reports = self.reports.clone();
        let join = thread::Builder::new()
            .name("supervisor".to_string())
            .spawn(move || {
                if let Err(err) = self.run() {
                    log::error!("supervisor: {err:#}");
                }
            })
            .context("spawn supervisor thread")?;
        Ok(SupervisorHandle {
            shutdown,
            reports,
            join,
        })
    }

    /// One monitoring pass: reap finished units, abandon stalled ones and
    /// start whatever is due.
    pub fn poll_once(&mut self) {
        let now = Instant::now();
        let now_ms = current_millis();
        let backoff = self.settings.restart_backoff;
        let stall_timeout = self.settings.stall_timeout;
        let shutting_down = self.shutdown.load(Ordering::Relaxed);

        for index in 0..self.units.len() {
            let finished = self.units[index]
                .running
                .as_ref()
                .is_some_and(|r| r.handle.is_finished());
            if finished {
                if let Some(running) = self.units[index].running.take() {
                    let outcome = running.handle.join();
                    self.on_exit(index, outcome, now + backoff);
                }
            }

            let stalled = {
                let unit = &self.units[index];
                unit.watched
                    && unit
                        .running
                        .as_ref()
                        .is_some_and(|r| r.ctx.heartbeat().is_stale(now_ms, stall_timeout))
            };
            if stalled {
                self.on_stall(index, now_ms, now);
            }

            let due = {
                let unit = &self.units[index];
                unit.running.is_none() && unit.restart_at.is_some_and(|at| at <= now)
            };
            if due && !shutting_down {
                self.start_unit(index, now + backoff);
            }
        }

        let reports = self.units.iter().map(|u| u.report(now_ms)).collect();
        if let Ok(mut guard) = self.reports.lock() {
            *guard = reports;
        }
    }

    pub fn reports(&self) -> Vec<UnitReport> {
        match self.reports.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn start_unit(&mut self, index: usize, retry_at: Instant) {
        let grace = self.settings.stall_timeout;
        let shutdown = self.shutdown.clone();
        let unit = &mut self.units[index];
        let task = match (unit.factory)() {
            Ok(task) => task,
            Err(err) => {
                log::error!("supervisor: unit {} failed to build: {err:#}", unit.name);
                unit.last_failure = Some(format!("{err:#}"));
                unit.restart_at = Some(retry_at);
                return;
            }
        };

        let ctx = TaskContext::new(
            Arc::new(Heartbeat::new(grace)),
            Arc::new(AtomicBool::new(false)),
            shutdown,
        );
        let thread_ctx = ctx.clone();
        let mut task = task;
        let spawned = thread::Builder::new()
            .name(format!("unit-{}", unit.name))
            .spawn(move || task.run(&thread_ctx));
        match spawned {
            Ok(handle) => {
                if unit.generation > 0 {
                    unit.restarts += 1;
                }
                unit.generation += 1;
                unit.restart_at = None;
                unit.running = Some(Running { handle, ctx });
                log::info!(
                    "supervisor: started unit {} (generation {})",
                    unit.name,
                    unit.generation
                );
            }
            Err(err) => {
                log::error!("supervisor: failed to spawn unit {}: {err}", unit.name);
                unit.last_failure = Some(err.to_string());
                unit.restart_at = Some(retry_at);
            }
        }
    }

    fn on_exit(&mut self, index: usize, outcome: thread::Result<Result<()>>, retry_at: Instant) {
        let shutting_down = self.shutdown.load(Ordering::Relaxed);
        let unit = &mut self.units[index];
        let (kind, message) = match outcome {
            Ok(Ok(())) if shutting_down => return,
            Ok(Ok(())) => (FailureKind::Other, "returned unexpectedly".to_string()),
            Ok(Err(err)) => (PipelineError::classify(&err), format!("{err:#}")),
            Err(panic) => (FailureKind::Other, format!("panicked: {}", panic_message(&*panic))),
        };
        log::error!(
            "supervisor: unit {} failed ({}): {message}; restarting in {:?}",
            unit.name,
            kind.label(),
            self.settings.restart_backoff
        );
        unit.last_failure = Some(message.clone());
        unit.restart_at = Some(retry_at);
        let notice = Notice::UnitFailed {
            unit: unit.name.clone(),
            kind,
            message,
            stalled: false,
        };
        self.publish(notice);
    }

    fn on_stall(&mut self, index: usize, now_ms: u64, now: Instant) {
        let timeout = self.settings.stall_timeout;
        let unit = &mut self.units[index];
        let Some(running) = unit.running.take() else {
            return;
        };
        let age = running.ctx.heartbeat().age_ms(now_ms);
        log::error!(
            "supervisor: unit {} stalled (no heartbeat for {age} ms, limit {:?}); force-restarting",
            unit.name,
            timeout
        );
        running.ctx.cancel();
        // The stuck thread is detached; it exits on its own once it notices
        // the cancelled generation.
        drop(running.handle);
        unit.stalls += 1;
        unit.restart_at = Some(now);
        let message = format!("no heartbeat for {age} ms");
        unit.last_failure = Some(message.clone());
        let notice = Notice::UnitFailed {
            unit: unit.name.clone(),
            kind: FailureKind::Other,
            message,
            stalled: true,
        };
        self.publish(notice);
    }

    fn publish(&self, notice: Notice) {
        if let Some(tx) = &self.notices {
            if tx.send(notice).is_err() {
                log::debug!("supervisor: notice channel closed");
            }
        }
    }

    fn log_report(&self) {
        let now_ms = current_millis();
        for unit in self.units.iter().filter(|u| u.watched) {
            let report = unit.report(now_ms);
            match report.load {
                Some(load) => log::info!(
                    "supervisor: {} load {:.2} heartbeat age {} ms",
                    report.name,
                    load,
                    report.heartbeat_age_ms.unwrap_or_default()
                ),
                None => log::debug!(
                    "supervisor: {} heartbeat age {:?} ms",
                    report.name,
                    report.heartbeat_age_ms
                ),
            }
        }
    }

    fn stop_all(&mut self) {
        log::info!("supervisor: stopping units");
        for unit in &mut self.units {
            if let Some(running) = unit.running.take() {
                running.ctx.cancel();
                let deadline = Instant::now() + Duration::from_secs(2);
                while !running.handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                if running.handle.is_finished() {
                    if let Ok(Err(err)) = running.handle.join() {
                        log::warn!("supervisor: unit {} exited with {err:#}", unit.name);
                    }
                } else {
                    log::warn!("supervisor: unit {} did not stop in time", unit.name);
                }
            }
        }
    }
}

/// Control handle for a supervisor running on its own thread.
pub struct SupervisorHandle {
    shutdown: Arc<AtomicBool>,
    reports: Arc<Mutex<Vec<UnitReport>>>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn reports(&self) -> Vec<UnitReport> {
        match self.reports.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn report(&self, name: &str) -> Option<UnitReport> {
        self.reports().into_iter().find(|r| r.name == name)
    }

    pub fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join
            .join()
            .map_err(|_| anyhow!("supervisor thread panicked"))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
