use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use super::clip::{ClipCodec, ClipNotice, ClipWriter};
use crate::buffer::BufferError;
use crate::camera::{CameraState, SegmentInfo};
use crate::clock::Clock;
use crate::media::MediaLayout;
use crate::supervisor::{Task, TaskContext};

#[derive(Clone, Debug)]
pub struct RecorderSettings {
    pub max_clip: Duration,
    /// Poll interval while the record flag is clear.
    pub idle_poll: Duration,
    /// Wait when recording but the buffer is momentarily empty.
    pub empty_wait: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_clip: Duration::from_secs(30 * 60),
            idle_poll: Duration::from_secs(2),
            empty_wait: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// Result of one recorder step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderStep {
    /// A frame was written; step again right away.
    Wrote,
    /// Nothing to do; wait this long before the next step.
    Wait(Duration),
}

struct OpenClip {
    writer: Box<dyn ClipWriter>,
    notice: ClipNotice,
}

/// Drains a camera's ring buffer into clip files while its record flag is set.
pub struct ClipRecorder {
    name: String,
    camera: Arc<CameraState>,
    layout: MediaLayout,
    codec: Arc<dyn ClipCodec>,
    clock: Arc<dyn Clock>,
    finished: Sender<ClipNotice>,
    settings: RecorderSettings,
    open: Option<OpenClip>,
}

impl ClipRecorder {
    pub fn new(
        camera: Arc<CameraState>,
        layout: MediaLayout,
        codec: Arc<dyn ClipCodec>,
        clock: Arc<dyn Clock>,
        finished: Sender<ClipNotice>,
        settings: RecorderSettings,
    ) -> Self {
        Self {
            name: format!("record-{}", camera.id()),
            camera,
            layout,
            codec,
            clock,
            finished,
            settings,
            open: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        if self.open.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    pub fn step(&mut self) -> Result<RecorderStep> {
        if !self.camera.record_flag() {
            if self.open.is_some() {
                self.close("done")?;
            }
            return Ok(RecorderStep::Wait(self.settings.idle_poll));
        }

        if self.open.is_none() {
            log::info!("camera {}: recording started", self.camera.id());
            self.open_clip()?;
        }

        let frame = match self.camera.buffer().pop_oldest() {
            Ok(frame) => frame,
            Err(BufferError::EmptyBuffer) => {
                return Ok(RecorderStep::Wait(self.settings.empty_wait))
            }
            Err(err) => return Err(err).context("drain ring buffer"),
        };

        let Some(open) = self.open.as_mut() else {
            return Ok(RecorderStep::Wrote);
        };
        open.writer.write_frame(&frame)?;
        open.notice.frames += 1;
        let started_at = open.notice.started_at;
        self.camera.set_segment(Some(SegmentInfo {
            path: open.notice.path.clone(),
            started_at,
            frames: open.notice.frames,
        }));

        let elapsed = (self.clock.now() - started_at).to_std().unwrap_or_default();
        if elapsed >= self.settings.max_clip {
            self.close("segment done")?;
            self.open_clip()?;
        }
        Ok(RecorderStep::Wrote)
    }

    fn open_clip(&mut self) -> Result<()> {
        let started_at = self.clock.now();
        let id = self.camera.id();
        let shape = self.camera.settings().shape;
        let fps = self.camera.settings().fps;
        let path = self
            .layout
            .new_clip_path(id, started_at, self.codec.extension())?;
        let writer = self.codec.create(&path, shape, fps)?;
        log::debug!("camera {id}: writing {}", path.display());
        self.camera.set_segment(Some(SegmentInfo {
            path: path.clone(),
            started_at,
            frames: 0,
        }));
        self.open = Some(OpenClip {
            writer,
            notice: ClipNotice {
                camera: id,
                path,
                started_at,
                shape,
                fps,
                frames: 0,
            },
        });
        Ok(())
    }

    /// Close the open clip and hand it to file review. Empty clips are
    /// removed instead.
    fn close(&mut self, why: &str) -> Result<()> {
        let Some(OpenClip { writer, notice }) = self.open.take() else {
            return Ok(());
        };
        self.camera.set_segment(None);
        writer.finish()?;
        if notice.frames == 0 {
            let _ = std::fs::remove_file(&notice.path);
            log::debug!("camera {}: discarded empty clip", notice.camera);
            return Ok(());
        }
        log::info!(
            "camera {}: recording {why} ({} frames, {})",
            notice.camera,
            notice.frames,
            notice.path.display()
        );
        if self.finished.send(notice).is_err() {
            log::debug!("camera {}: file review disabled, clip not queued", self.camera.id());
        }
        Ok(())
    }
}

impl Task for ClipRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        while !ctx.should_stop() {
            match self.step() {
                Ok(RecorderStep::Wrote) => ctx.beat(),
                Ok(RecorderStep::Wait(wait)) => {
                    ctx.sleep(wait);
                }
                Err(err) => {
                    // Keep whatever was written so far.
                    if let Err(close_err) = self.close("aborted") {
                        log::warn!("camera {}: {close_err:#}", self.camera.id());
                    }
                    return Err(err);
                }
            }
        }
        self.close("stopped")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraSettings;
    use crate::clock::ManualClock;
    use crate::frame::{Frame, FrameShape};
    use crate::record::RawClipCodec;
    use chrono::Local;

    fn setup(dir: &std::path::Path) -> (Arc<CameraState>, ClipRecorder, crossbeam_channel::Receiver<ClipNotice>) {
        let shape = FrameShape::rgb8(2, 2);
        let camera = Arc::new(CameraState::new(CameraSettings::new(4, "stub://", shape), 8).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let recorder = ClipRecorder::new(
            camera.clone(),
            MediaLayout::new(dir),
            Arc::new(RawClipCodec),
            Arc::new(ManualClock::new(Local::now())),
            tx,
            RecorderSettings::default(),
        );
        (camera, recorder, rx)
    }

    #[test]
    fn idle_without_flag() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (camera, mut recorder, rx) = setup(dir.path());
        camera.buffer().append(&Frame::filled(camera.settings().shape, 1)?)?;
        assert_eq!(recorder.step()?, RecorderStep::Wait(Duration::from_secs(2)));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(camera.buffer().len()?, 1);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn drains_pre_roll_then_hands_off() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (camera, mut recorder, rx) = setup(dir.path());
        let shape = camera.settings().shape;
        for v in 0..3 {
            camera.buffer().append(&Frame::filled(shape, v)?)?;
        }
        camera.set_record_flag(true);
        for _ in 0..3 {
            assert_eq!(recorder.step()?, RecorderStep::Wrote);
        }
        assert_eq!(recorder.step()?, RecorderStep::Wait(Duration::from_millis(50)));
        assert_eq!(camera.segment().map(|s| s.frames), Some(3));

        camera.set_record_flag(false);
        recorder.step()?;
        let notice = rx.try_recv()?;
        assert_eq!(notice.frames, 3);
        assert!(notice.path.starts_with(dir.path().join("videos/4")));
        assert!(camera.segment().is_none());
        Ok(())
    }

    #[test]
    fn empty_clip_is_not_handed_off() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (camera, mut recorder, rx) = setup(dir.path());
        camera.set_record_flag(true);
        recorder.step()?;
        assert_eq!(recorder.state(), RecorderState::Recording);
        camera.set_record_flag(false);
        recorder.step()?;
        assert!(rx.try_recv().is_err());
        assert_eq!(std::fs::read_dir(dir.path().join("videos/4"))?.count(), 0);
        Ok(())
    }
}
