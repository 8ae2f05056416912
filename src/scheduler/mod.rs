//! The detection scheduler.
//!
//! A single unit owns the detector backend. Each cycle it looks at the most
//! recently appended frame of every camera (the recorder may already have
//! drained it from the ring), advances the per-camera record counters, and then
//! spends part of whatever is left of the cycle on file-review frames:
//!
//! ```text
//! | live: camera 1 .. camera N | review drain (65% of the rest) | sleep |
//! |<------------------------- cycle ------------------------------->|
//! ```
//!
//! The drain budget is the number of review inferences expected to fit, from
//! a moving average of recent inference times. When live work alone overruns
//! the cycle the budget is zero and review stalls until load drops.

mod budget;
mod hysteresis;

pub use budget::{drain_budget, InferenceTimer, LoadMeter, DRAIN_MARGIN};
pub use hysteresis::{CounterStep, RecordCounter, Transition};

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};

use crate::buffer::BufferError;
use crate::camera::{CameraState, SharedState};
use crate::detect::{annotate, inspect, Detection, SharedBackend, SourceKey};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::notify::Notice;
use crate::review::{ReviewItem, ReviewResult};
use crate::supervisor::{Heartbeat, Task, TaskContext};

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub cycle: Duration,
    /// Consecutive positive cycles needed to start recording.
    pub detections_for_event: u32,
    /// Zoom in on every candidate and keep only the ones that hold up.
    pub reverify: bool,
    /// Look at a fresh frame right away while a camera's counter is
    /// elevated but below the threshold.
    pub recheck: bool,
    pub initial_inference: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(1),
            detections_for_event: 5,
            reverify: true,
            recheck: true,
            initial_inference: Duration::from_millis(20),
        }
    }
}

/// Review queues as seen from the inference side.
#[derive(Clone)]
pub struct ReviewLink {
    pub to_infer: Receiver<ReviewItem>,
    pub from_infer: Sender<ReviewResult>,
    /// Capacity of `from_infer`; draining never takes more than fits there.
    pub capacity: usize,
}

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub cameras_checked: usize,
    pub live_inferences: usize,
    pub rechecks: usize,
    pub raised: usize,
    pub cleared: usize,
    pub drain_budget: usize,
    pub drained: usize,
    /// Seconds left of the cycle after all work; negative on overrun.
    pub time_left: f64,
    pub load: f64,
    pub average_inference: Duration,
}

pub struct DetectionScheduler {
    state: Arc<SharedState>,
    backend: SharedBackend,
    backend_name: String,
    review: Option<ReviewLink>,
    notices: Sender<Notice>,
    settings: SchedulerSettings,
    counter: RecordCounter,
    timer: InferenceTimer,
    load: LoadMeter,
}

impl DetectionScheduler {
    pub fn new(
        state: Arc<SharedState>,
        backend: SharedBackend,
        notices: Sender<Notice>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let backend_name = backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?
            .name()
            .to_string();
        Ok(Self {
            state,
            backend,
            backend_name,
            review: None,
            notices,
            counter: RecordCounter::new(settings.detections_for_event),
            timer: InferenceTimer::new(settings.initial_inference),
            load: LoadMeter::default(),
            settings,
        })
    }

    pub fn with_review(mut self, link: ReviewLink) -> Self {
        self.review = Some(link);
        self
    }

    pub fn average_inference(&self) -> Duration {
        self.timer.average()
    }

    pub fn load(&self) -> f64 {
        self.load.value()
    }

    /// One full cycle without the trailing sleep.
    pub fn run_cycle(&mut self, heartbeat: Option<&Heartbeat>) -> Result<CycleReport> {
        let started = Instant::now();
        let cycle = self.settings.cycle.as_secs_f64();
        let mut report = CycleReport::default();

        let cameras: Vec<Arc<CameraState>> = self.state.cameras().to_vec();
        for camera in &cameras {
            self.check_camera(camera, &mut report)?;
        }

        let time_left = cycle - started.elapsed().as_secs_f64();
        report.drain_budget = drain_budget(time_left, self.timer.average_secs());
        report.drained = self.drain_review(report.drain_budget)?;

        report.time_left = cycle - started.elapsed().as_secs_f64();
        report.load = self.load.update(report.time_left, cycle);
        report.average_inference = self.timer.average();
        if let Some(heartbeat) = heartbeat {
            heartbeat.beat_with_load(report.load);
        }
        log::debug!(
            "detect: cycle checked {} cameras ({} rechecks), drained {}/{} review frames, {:.3}s left, load {:.2}",
            report.cameras_checked,
            report.rechecks,
            report.drained,
            report.drain_budget,
            report.time_left,
            report.load
        );
        Ok(report)
    }

    fn check_camera(&mut self, camera: &CameraState, report: &mut CycleReport) -> Result<()> {
        let threshold = self.counter.threshold() as usize;
        let mut rechecks = 0;
        loop {
            let frame = match camera.buffer().latest() {
                Ok(frame) => frame,
                Err(BufferError::EmptyBuffer) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if rechecks == 0 {
                report.cameras_checked += 1;
            }

            let armed = self.state.is_armed(camera) && camera.settings().detect;
            let detections = if armed {
                report.live_inferences += 1;
                self.infer(SourceKey::Live(camera.id()), camera, &frame)?
            } else {
                Vec::new()
            };

            let step = self
                .counter
                .step(camera.record_counter(), detections.len(), camera.record_flag());
            camera.set_record_counter(step.value);
            match step.transition {
                Transition::Raised => {
                    report.raised += 1;
                    self.raise(camera, &frame, &detections);
                }
                Transition::Cleared => {
                    report.cleared += 1;
                    self.clear(camera, &frame);
                }
                Transition::None => {}
            }

            if step.recheck && self.settings.recheck && rechecks < threshold {
                rechecks += 1;
                report.rechecks += 1;
                continue;
            }
            return Ok(());
        }
    }

    fn raise(&self, camera: &CameraState, frame: &Frame, detections: &[Detection]) {
        camera.set_record_flag(true);
        let newly = self.state.system().raise_alarm();
        log::warn!(
            "camera {} ({}): detection confirmed, recording{}",
            camera.id(),
            camera.settings().name,
            if newly { ", alarm raised" } else { "" }
        );
        let region = camera
            .settings()
            .region
            .to_pixels(frame.width(), frame.height());
        self.publish(Notice::Snapshot {
            camera: camera.id(),
            frame: annotate(frame, &region, detections),
            caption: format!("Alarm active on camera {}", camera.settings().name),
        });
        self.publish(Notice::AlarmRaised { camera: camera.id() });
    }

    fn clear(&self, camera: &CameraState, frame: &Frame) {
        camera.set_record_flag(false);
        log::info!(
            "camera {} ({}): activity over, recording stops",
            camera.id(),
            camera.settings().name
        );
        if self.state.is_armed(camera) {
            let region = camera
                .settings()
                .region
                .to_pixels(frame.width(), frame.height());
            self.publish(Notice::Snapshot {
                camera: camera.id(),
                frame: annotate(frame, &region, &[]),
                caption: format!("Alarm cleared on camera {}", camera.settings().name),
            });
        }
        self.publish(Notice::AlarmCleared { camera: camera.id() });
    }

    fn infer(&mut self, source: SourceKey, camera: &CameraState, frame: &Frame) -> Result<Vec<Detection>> {
        let started = Instant::now();
        let outcome = {
            let mut backend = self
                .backend
                .lock()
                .map_err(|_| anyhow!("detector backend lock poisoned"))?;
            inspect(&mut *backend, source, frame, camera.settings(), self.settings.reverify)
        };
        self.timer.record(started.elapsed());
        outcome.map_err(|err| {
            PipelineError::DetectionBackendFailure {
                backend: self.backend_name.clone(),
                source: err,
            }
            .into()
        })
    }

    fn drain_review(&mut self, budget: usize) -> Result<usize> {
        let Some(link) = self.review.clone() else {
            return Ok(0);
        };
        let room = link.capacity.saturating_sub(link.from_infer.len());
        let mut drained = 0;
        while drained < budget.min(room) {
            let Ok(item) = link.to_infer.try_recv() else {
                break;
            };
            let result = match item {
                ReviewItem::Begin(notice) => ReviewResult::Begin(notice),
                ReviewItem::Done(notice) => ReviewResult::Done(notice),
                ReviewItem::Frame { camera, frame } => match self.state.camera(camera).cloned() {
                    Some(state) => {
                        let detections = self.infer(SourceKey::Review(camera), &state, &frame)?;
                        let region = state
                            .settings()
                            .region
                            .to_pixels(frame.width(), frame.height());
                        ReviewResult::Annotated {
                            camera,
                            frame: annotate(&frame, &region, &detections),
                            detections: detections.len(),
                        }
                    }
                    None => {
                        log::warn!("detect: review frame for unknown camera {camera}");
                        ReviewResult::Annotated {
                            camera,
                            frame,
                            detections: 0,
                        }
                    }
                },
            };
            if link.from_infer.send(result).is_err() {
                log::warn!("detect: review result queue closed");
                break;
            }
            drained += 1;
        }
        Ok(drained)
    }

    fn publish(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            log::debug!("detect: no notification listener");
        }
    }
}

impl Task for DetectionScheduler {
    fn name(&self) -> &str {
        "detect"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        log::info!(
            "detect: scheduler running with backend {} (cycle {:?}, threshold {})",
            self.backend_name,
            self.settings.cycle,
            self.counter.threshold()
        );
        while !ctx.should_stop() {
            let report = self.run_cycle(Some(ctx.heartbeat()))?;
            if report.time_left > 0.0 && !ctx.sleep(Duration::from_secs_f64(report.time_left)) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraSettings;
    use crate::detect::{BoundingBox, StubBackend, StubControl};
    use crate::frame::FrameShape;
    use std::sync::Mutex;

    fn scheduler(threshold: u32) -> (DetectionScheduler, Arc<SharedState>, StubControl, Receiver<Notice>) {
        let shape = FrameShape::rgb8(64, 48);
        let camera = CameraState::new(CameraSettings::new(1, "stub://a", shape), 4).unwrap();
        let state = Arc::new(SharedState::new(true, vec![camera]).unwrap());
        let stub = StubBackend::new();
        let control = stub.control();
        let backend: SharedBackend = Arc::new(Mutex::new(stub));
        let (tx, rx) = crossbeam_channel::unbounded();
        let settings = SchedulerSettings {
            cycle: Duration::from_millis(200),
            detections_for_event: threshold,
            reverify: false,
            recheck: false,
            initial_inference: Duration::from_millis(1),
        };
        let scheduler = DetectionScheduler::new(state.clone(), backend, tx, settings).unwrap();
        (scheduler, state, control, rx)
    }

    fn person() -> Detection {
        Detection::new(BoundingBox::new(10.0, 10.0, 20.0, 40.0), 0, 0.9)
    }

    #[test]
    fn empty_buffer_is_skipped() {
        let (mut scheduler, state, control, _rx) = scheduler(2);
        let report = scheduler.run_cycle(None).unwrap();
        assert_eq!(report.cameras_checked, 0);
        assert_eq!(control.calls(), 0);
        assert_eq!(state.cameras()[0].record_counter(), 0);
    }

    #[test]
    fn drained_buffer_is_still_sampled() {
        let (mut scheduler, state, control, _rx) = scheduler(2);
        let camera = state.cameras()[0].clone();
        camera.buffer().append(&Frame::filled(camera.settings().shape, 0).unwrap()).unwrap();
        camera.buffer().pop_oldest().unwrap();
        control.set_fallback(vec![person()]);

        let report = scheduler.run_cycle(None).unwrap();
        assert_eq!(report.cameras_checked, 1);
        assert_eq!(control.calls(), 1);
        assert_eq!(camera.record_counter(), 1);
    }

    #[test]
    fn disarmed_camera_counts_as_empty() {
        let (mut scheduler, state, control, _rx) = scheduler(2);
        let camera = state.cameras()[0].clone();
        camera.buffer().append(&Frame::filled(camera.settings().shape, 0).unwrap()).unwrap();
        camera.set_record_counter(3);
        state.system().set_armed(false);
        control.set_fallback(vec![person()]);

        scheduler.run_cycle(None).unwrap();
        assert_eq!(control.calls(), 0);
        assert_eq!(camera.record_counter(), 2);
    }

    #[test]
    fn raise_publishes_snapshot_and_alarm() {
        let (mut scheduler, state, control, rx) = scheduler(2);
        let camera = state.cameras()[0].clone();
        camera.buffer().append(&Frame::filled(camera.settings().shape, 0).unwrap()).unwrap();
        control.set_fallback(vec![person()]);

        scheduler.run_cycle(None).unwrap();
        assert!(!camera.record_flag());
        let report = scheduler.run_cycle(None).unwrap();
        assert_eq!(report.raised, 1);
        assert!(camera.record_flag());
        assert!(state.system().alarm());

        let notices: Vec<Notice> = rx.try_iter().collect();
        assert!(matches!(&notices[0], Notice::Snapshot { caption, .. } if caption.starts_with("Alarm active")));
        assert!(matches!(notices[1], Notice::AlarmRaised { .. }));
    }

    #[test]
    fn backend_failure_is_classified() {
        let (mut scheduler, state, control, _rx) = scheduler(2);
        let camera = state.cameras()[0].clone();
        camera.buffer().append(&Frame::filled(camera.settings().shape, 0).unwrap()).unwrap();
        control.push_failure("model crashed");
        let err = scheduler.run_cycle(None).unwrap_err();
        assert_eq!(
            PipelineError::classify(&err),
            crate::error::FailureKind::DetectionBackend
        );
    }
}
