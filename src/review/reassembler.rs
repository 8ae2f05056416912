use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::ReviewResult;
use crate::error::PipelineError;
use crate::media::MediaLayout;
use crate::record::{ClipCodec, ClipNotice, ClipWriter};
use crate::supervisor::{Task, TaskContext};

const POLL: Duration = Duration::from_millis(200);

struct Assembly {
    notice: ClipNotice,
    writer: Box<dyn ClipWriter>,
    output: PathBuf,
    frames: u64,
}

/// Writes annotated frames back into a clip mirrored under the annotated
/// tree. Frames arriving outside a `Begin`/`Done` pair are dropped.
pub struct ReviewReassembler {
    from_infer: Receiver<ReviewResult>,
    requeue: Sender<ClipNotice>,
    layout: MediaLayout,
    codec: Arc<dyn ClipCodec>,
    delete_raw: bool,
    open: Option<Assembly>,
    completed: u64,
}

impl ReviewReassembler {
    pub fn new(
        from_infer: Receiver<ReviewResult>,
        requeue: Sender<ClipNotice>,
        layout: MediaLayout,
        codec: Arc<dyn ClipCodec>,
        delete_raw: bool,
    ) -> Self {
        Self {
            from_infer,
            requeue,
            layout,
            codec,
            delete_raw,
            open: None,
            completed: 0,
        }
    }

    /// Clips fully written since this reassembler started.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn handle(&mut self, result: ReviewResult) -> Result<()> {
        match result {
            ReviewResult::Begin(notice) => {
                if let Some(stale) = self.open.take() {
                    log::warn!(
                        "review: restarting annotation of {} after {} frames",
                        stale.notice.path.display(),
                        stale.frames
                    );
                    discard(stale);
                }
                let output = self.layout.annotated_path_for(notice.camera, &notice.path)?;
                let writer = self.codec.create(&output, notice.shape, notice.fps)?;
                self.open = Some(Assembly {
                    notice,
                    writer,
                    output,
                    frames: 0,
                });
            }
            ReviewResult::Annotated { camera, frame, .. } => match self.open.as_mut() {
                Some(assembly) if assembly.notice.camera == camera => {
                    assembly.writer.write_frame(&frame)?;
                    assembly.frames += 1;
                }
                _ => log::debug!("review: dropping frame of camera {camera} outside a clip"),
            },
            ReviewResult::Done(notice) => {
                let matches = self
                    .open
                    .as_ref()
                    .is_some_and(|a| a.notice.path == notice.path);
                if !matches {
                    log::debug!("review: ignoring stray end of {}", notice.path.display());
                    return Ok(());
                }
                let Some(assembly) = self.open.take() else {
                    return Ok(());
                };
                let Assembly {
                    notice,
                    writer,
                    output,
                    frames,
                } = assembly;
                writer.finish()?;
                self.completed += 1;
                log::info!(
                    "camera {}: review of {} complete ({frames} frames -> {})",
                    notice.camera,
                    notice.path.display(),
                    output.display()
                );
                if self.delete_raw {
                    if let Err(err) = std::fs::remove_file(&notice.path) {
                        log::warn!("review: could not remove {}: {err}", notice.path.display());
                    }
                }
            }
        }
        Ok(())
    }

    /// Put the clip being assembled back on the order queue.
    fn requeue_open(&mut self) {
        if let Some(assembly) = self.open.take() {
            let notice = assembly.notice.clone();
            discard(assembly);
            if self.requeue.send(notice).is_err() {
                log::error!("review: could not requeue clip after failure");
            }
        }
    }
}

fn discard(assembly: Assembly) {
    let Assembly { writer, output, .. } = assembly;
    let _ = writer.finish();
    let _ = std::fs::remove_file(output);
}

impl Task for ReviewReassembler {
    fn name(&self) -> &str {
        "review-reassemble"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        while !ctx.should_stop() {
            let result = match self.from_infer.recv_timeout(POLL) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    ctx.beat();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("inference result queue closed"))
                }
            };
            let begin_notice = match &result {
                ReviewResult::Begin(notice) => Some(notice.clone()),
                _ => None,
            };
            if let Err(err) = self.handle(result) {
                match (self.open.is_some(), begin_notice) {
                    (true, _) => self.requeue_open(),
                    (false, Some(notice)) => {
                        if self.requeue.send(notice).is_err() {
                            log::error!("review: could not requeue clip after failure");
                        }
                    }
                    (false, None) => {}
                }
                return Err(PipelineError::PipelineStageFailure {
                    stage: "review-reassemble",
                    source: err,
                }
                .into());
            }
            ctx.beat();
        }
        Ok(())
    }
}
