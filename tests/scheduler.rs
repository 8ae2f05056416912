use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender};

use ringwatch::camera::{CameraSettings, CameraState, SharedState};
use ringwatch::clock::ManualClock;
use ringwatch::detect::{BoundingBox, Detection, SharedBackend, StubBackend, StubControl};
use ringwatch::media::MediaLayout;
use ringwatch::notify::Notice;
use ringwatch::record::{ClipRecorder, RawClipCodec, RecorderSettings, RecorderStep};
use ringwatch::review::{ReviewItem, ReviewResult};
use ringwatch::scheduler::ReviewLink;
use ringwatch::{CameraId, DetectionScheduler, Frame, FrameShape, SchedulerSettings};

fn shape() -> FrameShape {
    FrameShape::rgb8(64, 48)
}

fn person() -> Detection {
    Detection::new(BoundingBox::new(10.0, 10.0, 20.0, 40.0), 0, 0.9)
}

struct Rig {
    scheduler: DetectionScheduler,
    state: Arc<SharedState>,
    control: StubControl,
    notices: Receiver<Notice>,
}

fn rig(cameras: u32, settings: SchedulerSettings) -> Rig {
    let cameras = (1..=cameras)
        .map(|id| {
            let camera = CameraState::new(CameraSettings::new(id, "stub://cam", shape()), 4).unwrap();
            camera
                .buffer()
                .append(&Frame::filled(shape(), id as u8).unwrap())
                .unwrap();
            camera
        })
        .collect();
    let state = Arc::new(SharedState::new(true, cameras).unwrap());
    let stub = StubBackend::new();
    let control = stub.control();
    let backend: SharedBackend = Arc::new(Mutex::new(stub));
    let (tx, rx) = unbounded();
    let scheduler = DetectionScheduler::new(state.clone(), backend, tx, settings).unwrap();
    Rig {
        scheduler,
        state,
        control,
        notices: rx,
    }
}

fn settings(threshold: u32, recheck: bool) -> SchedulerSettings {
    SchedulerSettings {
        cycle: Duration::from_millis(200),
        detections_for_event: threshold,
        reverify: false,
        recheck,
        initial_inference: Duration::from_millis(1),
    }
}

#[test]
fn five_positive_cycles_raise_exactly_on_the_fifth() {
    let mut rig = rig(1, settings(5, false));
    let camera = rig.state.cameras()[0].clone();
    rig.control.set_fallback(vec![person()]);

    for cycle in 1..=4 {
        let report = rig.scheduler.run_cycle(None).unwrap();
        assert_eq!(report.raised, 0, "raised early in cycle {cycle}");
        assert!(!camera.record_flag());
        assert!(!rig.state.system().alarm());
    }
    let report = rig.scheduler.run_cycle(None).unwrap();
    assert_eq!(report.raised, 1);
    assert!(camera.record_flag());
    assert!(rig.state.system().alarm());
    assert_eq!(camera.record_counter(), 5);

    // Activity ends: the flag clears once the counter decays back to one.
    rig.control.set_fallback(Vec::new());
    let mut cleared_at = None;
    for cycle in 1..=6 {
        let report = rig.scheduler.run_cycle(None).unwrap();
        if report.cleared == 1 {
            cleared_at = Some(cycle);
            break;
        }
        assert!(camera.record_flag());
    }
    assert_eq!(cleared_at, Some(4));
    assert!(!camera.record_flag());

    let kinds: Vec<&'static str> = rig
        .notices
        .try_iter()
        .map(|notice| match notice {
            Notice::Snapshot { .. } => "snapshot",
            Notice::AlarmRaised { .. } => "raised",
            Notice::AlarmCleared { .. } => "cleared",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["snapshot", "raised", "snapshot", "cleared"]);
}

#[test]
fn clear_after_disarm_skips_the_snapshot() {
    let mut rig = rig(1, settings(3, false));
    let camera = rig.state.cameras()[0].clone();
    rig.control.set_fallback(vec![person()]);
    for _ in 0..4 {
        rig.scheduler.run_cycle(None).unwrap();
    }
    assert!(camera.record_flag());
    assert_eq!(camera.record_counter(), 4);
    rig.notices.try_iter().count();

    camera.set_armed(false);
    let mut cleared = 0;
    for _ in 0..3 {
        cleared += rig.scheduler.run_cycle(None).unwrap().cleared;
    }
    assert_eq!(cleared, 1);
    assert_eq!(camera.record_counter(), 1);
    assert!(!camera.record_flag());

    let notices: Vec<Notice> = rig.notices.try_iter().collect();
    assert_eq!(notices.len(), 1, "unexpected notices: {notices:?}");
    assert!(matches!(notices[0], Notice::AlarmCleared { camera } if camera == CameraId(1)));
}

#[test]
fn cleared_snapshot_carries_the_region_overlay() {
    let mut rig = rig(1, settings(2, false));
    let camera = rig.state.cameras()[0].clone();
    rig.control.set_fallback(vec![person()]);
    for _ in 0..2 {
        rig.scheduler.run_cycle(None).unwrap();
    }
    rig.control.set_fallback(Vec::new());
    rig.notices.try_iter().count();
    assert_eq!(rig.scheduler.run_cycle(None).unwrap().cleared, 1);
    assert!(!camera.record_flag());

    let raw = camera.buffer().latest().unwrap();
    let snapshot = rig
        .notices
        .try_iter()
        .find_map(|notice| match notice {
            Notice::Snapshot { frame, caption, .. } if caption.starts_with("Alarm cleared") => {
                Some(frame)
            }
            _ => None,
        })
        .expect("cleared snapshot");
    assert_eq!(snapshot.shape(), raw.shape());
    assert_ne!(snapshot, raw);
}

#[test]
fn recording_camera_keeps_being_sampled_while_drained() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rig = rig(1, settings(3, false));
    let camera = rig.state.cameras()[0].clone();
    let (clips_tx, clips_rx) = unbounded();
    let mut recorder = ClipRecorder::new(
        camera.clone(),
        MediaLayout::new(dir.path()),
        Arc::new(RawClipCodec),
        Arc::new(ManualClock::new(Local::now())),
        clips_tx,
        RecorderSettings::default(),
    );

    let cycle = |rig: &mut Rig, recorder: &mut ClipRecorder, value: u8| {
        camera
            .buffer()
            .append(&Frame::filled(shape(), value).unwrap())
            .unwrap();
        while recorder.step().unwrap() == RecorderStep::Wrote {}
        rig.scheduler.run_cycle(None).unwrap()
    };

    rig.control.set_fallback(vec![person()]);
    for value in 0..5 {
        let report = cycle(&mut rig, &mut recorder, value);
        assert_eq!(report.cameras_checked, 1);
    }
    assert!(camera.record_flag());
    assert_eq!(camera.record_counter(), 5);

    // The recorder empties the ring before every cycle from here on.
    rig.control.set_fallback(Vec::new());
    let mut cleared_at = None;
    for n in 1..=6 {
        let report = cycle(&mut rig, &mut recorder, 100 + n);
        assert!(camera.buffer().is_empty().unwrap() || !camera.record_flag());
        assert_eq!(report.cameras_checked, 1, "camera skipped in cycle {n}");
        if report.cleared == 1 {
            cleared_at = Some(n);
            break;
        }
    }
    assert_eq!(cleared_at, Some(4));
    assert_eq!(camera.record_counter(), 1);

    recorder.step().unwrap();
    let clip = clips_rx.try_recv().expect("finished clip");
    assert!(clip.frames > 0);
}

#[test]
fn cameras_keep_independent_counters() {
    let mut rig = rig(2, settings(3, false));
    for _ in 0..3 {
        rig.control.push(vec![person()]);
        rig.control.push(Vec::new());
        rig.scheduler.run_cycle(None).unwrap();
    }
    let first = rig.state.camera(CameraId(1)).unwrap();
    let second = rig.state.camera(CameraId(2)).unwrap();
    assert!(first.record_flag());
    assert_eq!(first.record_counter(), 3);
    assert!(!second.record_flag());
    assert_eq!(second.record_counter(), 0);
}

#[test]
fn recheck_reaches_threshold_within_one_cycle() {
    let mut rig = rig(1, settings(5, true));
    rig.control.set_fallback(vec![person()]);
    let report = rig.scheduler.run_cycle(None).unwrap();
    assert_eq!(report.rechecks, 4);
    assert_eq!(report.live_inferences, 5);
    assert_eq!(report.raised, 1);
    assert!(rig.state.cameras()[0].record_flag());

    // Flag set: no more rechecks, one inference per cycle.
    let report = rig.scheduler.run_cycle(None).unwrap();
    assert_eq!(report.rechecks, 0);
    assert_eq!(report.live_inferences, 1);
}

#[test]
fn disarming_the_system_decays_counters_without_inference() {
    let mut rig = rig(1, settings(5, false));
    let camera = rig.state.cameras()[0].clone();
    rig.control.set_fallback(vec![person()]);
    for _ in 0..3 {
        rig.scheduler.run_cycle(None).unwrap();
    }
    assert_eq!(camera.record_counter(), 3);

    rig.state.system().set_armed(false);
    let calls = rig.control.calls();
    for _ in 0..3 {
        rig.scheduler.run_cycle(None).unwrap();
    }
    assert_eq!(rig.control.calls(), calls);
    assert_eq!(camera.record_counter(), 0);
}

fn review_link(capacity: usize) -> (ReviewLink, Sender<ReviewItem>, Receiver<ReviewResult>) {
    let (to_tx, to_rx) = unbounded();
    let (from_tx, from_rx) = unbounded();
    (
        ReviewLink {
            to_infer: to_rx,
            from_infer: from_tx,
            capacity,
        },
        to_tx,
        from_rx,
    )
}

fn mean(values: &[usize]) -> f64 {
    values.iter().sum::<usize>() as f64 / values.len() as f64
}

#[test]
fn slower_backend_shrinks_the_review_drain() {
    let rig = rig(
        1,
        SchedulerSettings {
            cycle: Duration::from_millis(100),
            detections_for_event: 5,
            reverify: false,
            recheck: false,
            initial_inference: Duration::from_millis(5),
        },
    );
    let (link, to_infer, from_infer) = review_link(10_000);
    let mut scheduler = rig.scheduler.with_review(link);
    for _ in 0..2000 {
        to_infer
            .send(ReviewItem::Frame {
                camera: CameraId(1),
                frame: Frame::filled(shape(), 7).unwrap(),
            })
            .unwrap();
    }

    rig.control.set_latency(Duration::from_millis(5));
    let mut fast = Vec::new();
    for _ in 0..15 {
        let report = scheduler.run_cycle(None).unwrap();
        fast.push(report.drained);
        from_infer.try_iter().count();
    }
    let fast_average = scheduler.average_inference();

    rig.control.set_latency(Duration::from_millis(10));
    let mut slow = Vec::new();
    for _ in 0..20 {
        let report = scheduler.run_cycle(None).unwrap();
        slow.push(report.drained);
        from_infer.try_iter().count();
    }
    let slow_average = scheduler.average_inference();

    assert!(fast_average >= Duration::from_millis(5));
    assert!(slow_average >= Duration::from_millis(9), "average stuck at {slow_average:?}");
    assert!(slow_average.as_secs_f64() > fast_average.as_secs_f64() * 1.5);
    assert!(
        mean(&slow[15..]) < mean(&fast[10..]),
        "drain did not shrink: fast {fast:?} slow {slow:?}"
    );
    assert!(slow.iter().all(|&drained| drained > 0));
}

#[test]
fn drain_never_exceeds_free_result_slots() {
    let rig = rig(
        1,
        SchedulerSettings {
            initial_inference: Duration::from_micros(100),
            ..settings(5, false)
        },
    );
    let (link, to_infer, from_infer) = review_link(3);
    let mut scheduler = rig.scheduler.with_review(link);
    for _ in 0..10 {
        to_infer
            .send(ReviewItem::Frame {
                camera: CameraId(1),
                frame: Frame::filled(shape(), 1).unwrap(),
            })
            .unwrap();
    }
    let report = scheduler.run_cycle(None).unwrap();
    assert_eq!(report.drained, 3);
    let report = scheduler.run_cycle(None).unwrap();
    assert_eq!(report.drained, 0);
    assert_eq!(from_infer.len(), 3);
}
