use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::{FramePacer, FrameSource};
use crate::camera::CameraState;
use crate::error::PipelineError;
use crate::supervisor::{Task, TaskContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestPhase {
    Connecting,
    Streaming,
    Reconnecting,
}

/// Moves frames from one camera into its ring buffer.
///
/// Stream errors never leave this loop: they are logged as connection
/// failures and retried after `backoff`.
pub struct StreamIngestor {
    name: String,
    camera: Arc<CameraState>,
    source: Box<dyn FrameSource>,
    pacer: FramePacer,
    backoff: Duration,
    phase: IngestPhase,
    frames_in: u64,
    frames_out: u64,
}

impl StreamIngestor {
    pub fn new(camera: Arc<CameraState>, source: Box<dyn FrameSource>, backoff: Duration) -> Self {
        let pacer = FramePacer::new(camera.settings().fps, camera.buffer().capacity());
        Self {
            name: format!("ingest-{}", camera.id()),
            camera,
            source,
            pacer,
            backoff,
            phase: IngestPhase::Connecting,
            frames_in: 0,
            frames_out: 0,
        }
    }

    pub fn phase(&self) -> IngestPhase {
        self.phase
    }

    /// Frames received from the source and frames written to the buffer.
    pub fn counters(&self) -> (u64, u64) {
        (self.frames_in, self.frames_out)
    }

    /// Advance the state machine by one step. Only the backoff wait in
    /// `Reconnecting` sleeps; returns false when the context asks to stop.
    pub fn step(&mut self, ctx: &TaskContext) -> bool {
        match self.phase {
            IngestPhase::Connecting => match self.source.connect() {
                Ok(()) => {
                    log::info!(
                        "camera {}: streaming from {}",
                        self.camera.id(),
                        self.source.describe()
                    );
                    self.pacer.reset(Instant::now());
                    self.phase = IngestPhase::Streaming;
                }
                Err(err) => self.fail(err),
            },
            IngestPhase::Streaming => match self.pump() {
                Ok(()) => ctx.beat(),
                Err(err) => self.fail(err),
            },
            IngestPhase::Reconnecting => {
                if !ctx.sleep(self.backoff) {
                    return false;
                }
                self.phase = IngestPhase::Connecting;
            }
        }
        !ctx.should_stop()
    }

    fn pump(&mut self) -> Result<()> {
        let frame = self.source.next_frame()?;
        self.frames_in += 1;
        let copies = self.pacer.copies(Instant::now());
        let buffer = self.camera.buffer();
        let mut guard = buffer.lock()?;
        for _ in 0..copies {
            guard.append(&frame).context("append frame")?;
        }
        self.frames_out += copies as u64;
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) {
        let err = PipelineError::ConnectionFailure {
            camera: self.camera.id(),
            source: err,
        };
        log::warn!("{err:#}; reconnecting in {:?}", self.backoff);
        self.phase = IngestPhase::Reconnecting;
    }
}

impl Task for StreamIngestor {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        while self.step(ctx) {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraSettings;
    use crate::frame::{Frame, FrameShape};
    use anyhow::anyhow;
    use std::collections::VecDeque;

    struct ScriptedSource {
        script: VecDeque<Result<Frame>>,
        connects: usize,
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            self.connects += 1;
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[test]
    fn read_failure_moves_to_reconnecting() {
        let shape = FrameShape::rgb8(2, 2);
        let mut settings = CameraSettings::new(1, "scripted://", shape);
        settings.fps = 1000;
        let camera = Arc::new(CameraState::new(settings, 50).unwrap());
        let frame = Frame::filled(shape, 9).unwrap();
        let source = ScriptedSource {
            script: VecDeque::from(vec![Ok(frame.clone()), Err(anyhow!("socket closed"))]),
            connects: 0,
        };
        let mut ingestor = StreamIngestor::new(camera.clone(), Box::new(source), Duration::ZERO);
        let ctx = TaskContext::detached();

        assert!(ingestor.step(&ctx));
        assert_eq!(ingestor.phase(), IngestPhase::Streaming);
        std::thread::sleep(Duration::from_millis(5));
        assert!(ingestor.step(&ctx));
        assert_eq!(ingestor.counters().0, 1);
        assert!(camera.buffer().len().unwrap() >= 1);
        assert_eq!(camera.buffer().newest().unwrap(), frame);

        assert!(ingestor.step(&ctx));
        assert_eq!(ingestor.phase(), IngestPhase::Reconnecting);
        assert!(ingestor.step(&ctx));
        assert_eq!(ingestor.phase(), IngestPhase::Connecting);
    }

    #[test]
    fn wrong_shape_is_a_stream_error() {
        let shape = FrameShape::rgb8(2, 2);
        let camera = Arc::new(CameraState::new(CameraSettings::new(1, "x", shape), 4).unwrap());
        let other = Frame::filled(FrameShape::rgb8(3, 3), 0).unwrap();
        let source = ScriptedSource {
            script: VecDeque::from(vec![Ok(other)]),
            connects: 0,
        };
        let mut ingestor = StreamIngestor::new(camera.clone(), Box::new(source), Duration::ZERO);
        let ctx = TaskContext::detached();
        ingestor.step(&ctx);
        std::thread::sleep(Duration::from_millis(50));
        ingestor.step(&ctx);
        assert_eq!(ingestor.phase(), IngestPhase::Reconnecting);
        assert_eq!(camera.buffer().len().unwrap(), 0);
    }
}
