use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use crossbeam_channel::unbounded;

use ringwatch::camera::{CameraSettings, CameraState, SharedState};
use ringwatch::detect::{BoundingBox, Detection, SharedBackend, StubBackend};
use ringwatch::media::MediaLayout;
use ringwatch::record::{ClipCodec, ClipNotice, RawClipCodec};
use ringwatch::review::{ReviewDecoder, ReviewQueues, ReviewReassembler};
use ringwatch::scheduler::ReviewLink;
use ringwatch::supervisor::TaskContext;
use ringwatch::{CameraId, DetectionScheduler, Frame, FrameShape, SchedulerSettings};

const BOX_PIXEL: [u8; 3] = [230, 40, 40];

fn shape() -> FrameShape {
    FrameShape::rgb8(64, 48)
}

#[test]
fn finished_clip_comes_back_annotated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = MediaLayout::new(dir.path());
    let codec: Arc<dyn ClipCodec> = Arc::new(RawClipCodec);

    let raw_path = layout
        .new_clip_path(CameraId(1), Local::now(), codec.extension())
        .expect("clip path");
    let mut writer = codec.create(&raw_path, shape(), 10).expect("create clip");
    for v in 0..6 {
        writer
            .write_frame(&Frame::filled(shape(), v * 10).expect("frame"))
            .expect("write");
    }
    writer.finish().expect("finish");
    let notice = ClipNotice {
        camera: CameraId(1),
        path: raw_path.clone(),
        started_at: Local::now(),
        shape: shape(),
        fps: 10,
        frames: 6,
    };

    let queues = ReviewQueues::new(16);
    let mut decoder = ReviewDecoder::new(
        queues.orders_rx(),
        queues.orders_tx(),
        queues.to_infer_tx(),
        codec.clone(),
    );
    assert_eq!(
        decoder
            .decode(&notice, &TaskContext::detached())
            .expect("decode"),
        6
    );

    // Live camera with nothing buffered: the whole cycle goes to review.
    let camera = CameraState::new(CameraSettings::new(1, "stub://cam", shape()), 4).expect("camera");
    let state = Arc::new(SharedState::new(true, vec![camera]).expect("state"));
    let stub = StubBackend::new();
    stub.control()
        .set_fallback(vec![Detection::new(BoundingBox::new(10.0, 10.0, 30.0, 40.0), 0, 0.9)]);
    let backend: SharedBackend = Arc::new(Mutex::new(stub));
    let (notices, _notices_rx) = unbounded();
    let mut scheduler = DetectionScheduler::new(
        state,
        backend,
        notices,
        SchedulerSettings {
            cycle: Duration::from_millis(200),
            reverify: false,
            initial_inference: Duration::from_millis(1),
            ..SchedulerSettings::default()
        },
    )
    .expect("scheduler")
    .with_review(ReviewLink {
        to_infer: queues.to_infer_rx(),
        from_infer: queues.from_infer_tx(),
        capacity: queues.capacity(),
    });

    let mut drained = 0;
    for _ in 0..10 {
        let report = scheduler.run_cycle(None).expect("cycle");
        assert_eq!(report.cameras_checked, 0);
        drained += report.drained;
        if drained == 8 {
            break;
        }
    }
    assert_eq!(drained, 8, "begin + 6 frames + done");

    let mut reassembler = ReviewReassembler::new(
        queues.from_infer_rx(),
        queues.orders_tx(),
        layout.clone(),
        codec.clone(),
        true,
    );
    for result in queues.from_infer_rx().try_iter() {
        reassembler.handle(result).expect("reassemble");
    }
    assert_eq!(reassembler.completed(), 1);
    assert!(!raw_path.exists(), "raw clip kept despite delete_raw");

    let output = layout
        .annotated_dir(CameraId(1))
        .join(raw_path.file_name().expect("file name"));
    let mut reader = codec.open(&output).expect("open annotated clip");
    let mut frames = 0;
    while let Some(frame) = reader.next_frame().expect("read") {
        let at = (10 * 64 + 20) * 3;
        assert_eq!(&frame.as_bytes()[at..at + 3], &BOX_PIXEL);
        frames += 1;
    }
    assert_eq!(frames, 6);
    assert!(queues.orders_rx().try_recv().is_err());
}
