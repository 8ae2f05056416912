use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::ReviewItem;
use crate::error::PipelineError;
use crate::record::{ClipCodec, ClipNotice};
use crate::supervisor::{Task, TaskContext};

const POLL: Duration = Duration::from_millis(200);

/// Opens finished clips and feeds their frames to the inference queue.
pub struct ReviewDecoder {
    orders: Receiver<ClipNotice>,
    requeue: Sender<ClipNotice>,
    to_infer: Sender<ReviewItem>,
    codec: Arc<dyn ClipCodec>,
}

impl ReviewDecoder {
    pub fn new(
        orders: Receiver<ClipNotice>,
        requeue: Sender<ClipNotice>,
        to_infer: Sender<ReviewItem>,
        codec: Arc<dyn ClipCodec>,
    ) -> Self {
        Self {
            orders,
            requeue,
            to_infer,
            codec,
        }
    }

    /// Decode one clip end to end. Blocks while `to_infer` is full.
    pub fn decode(&mut self, notice: &ClipNotice, ctx: &TaskContext) -> Result<u64> {
        log::info!(
            "camera {}: review of {} started",
            notice.camera,
            notice.path.display()
        );
        let mut reader = self.codec.open(&notice.path)?;
        self.send(ReviewItem::Begin(notice.clone()), ctx)?;
        let mut frames = 0;
        while let Some(frame) = reader.next_frame()? {
            self.send(
                ReviewItem::Frame {
                    camera: notice.camera,
                    frame,
                },
                ctx,
            )?;
            frames += 1;
        }
        self.send(ReviewItem::Done(notice.clone()), ctx)?;
        log::debug!(
            "camera {}: {frames} frames of {} queued for inference",
            notice.camera,
            notice.path.display()
        );
        Ok(frames)
    }

    fn send(&self, mut item: ReviewItem, ctx: &TaskContext) -> Result<()> {
        loop {
            if ctx.should_stop() {
                return Err(anyhow!("stopped while queueing review work"));
            }
            match self.to_infer.send_timeout(item, POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    ctx.beat();
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(anyhow!("inference queue closed"));
                }
            }
        }
    }
}

impl Task for ReviewDecoder {
    fn name(&self) -> &str {
        "review-decode"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        while !ctx.should_stop() {
            let notice = match self.orders.recv_timeout(POLL) {
                Ok(notice) => notice,
                Err(RecvTimeoutError::Timeout) => {
                    ctx.beat();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return Err(anyhow!("clip order queue closed")),
            };
            if let Err(err) = self.decode(&notice, ctx) {
                let path = notice.path.clone();
                if self.requeue.send(notice).is_err() {
                    log::error!("review: could not requeue {}", path.display());
                }
                return Err(PipelineError::PipelineStageFailure {
                    stage: "review-decode",
                    source: err.context(format!("decode {}", path.display())),
                }
                .into());
            }
        }
        Ok(())
    }
}
