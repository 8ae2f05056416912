//! File review: post-hoc inference over finished clips.
//!
//! ```text
//! recorder --ClipNotice--> [orders] --> ReviewDecoder --ReviewItem--> [to_infer]
//!                                                                        |
//!                                                   DetectionScheduler (spare cycle time)
//!                                                                        v
//!                         annotated clip <-- ReviewReassembler <--ReviewResult-- [from_infer]
//! ```
//!
//! `to_infer` and `from_infer` are bounded; a full `to_infer` pauses the
//! decoder. Each clip travels as `Begin`, its frames, then `Done`, so the
//! reassembler always knows which output file a frame belongs to.

mod decoder;
mod reassembler;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::camera::CameraId;
use crate::frame::Frame;
use crate::record::ClipNotice;

pub use decoder::ReviewDecoder;
pub use reassembler::ReviewReassembler;

/// Work for the inference side.
#[derive(Clone, Debug)]
pub enum ReviewItem {
    Begin(ClipNotice),
    Frame { camera: CameraId, frame: Frame },
    Done(ClipNotice),
}

/// What the inference side hands back, in the order it received the work.
#[derive(Clone, Debug)]
pub enum ReviewResult {
    Begin(ClipNotice),
    Annotated {
        camera: CameraId,
        frame: Frame,
        detections: usize,
    },
    Done(ClipNotice),
}

/// The three queues of the review pipeline.
#[derive(Clone)]
pub struct ReviewQueues {
    capacity: usize,
    orders: (Sender<ClipNotice>, Receiver<ClipNotice>),
    to_infer: (Sender<ReviewItem>, Receiver<ReviewItem>),
    from_infer: (Sender<ReviewResult>, Receiver<ReviewResult>),
}

impl ReviewQueues {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            orders: unbounded(),
            to_infer: bounded(capacity),
            from_infer: bounded(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Where recorders announce finished clips.
    pub fn orders_tx(&self) -> Sender<ClipNotice> {
        self.orders.0.clone()
    }

    pub fn orders_rx(&self) -> Receiver<ClipNotice> {
        self.orders.1.clone()
    }

    pub fn to_infer_tx(&self) -> Sender<ReviewItem> {
        self.to_infer.0.clone()
    }

    pub fn to_infer_rx(&self) -> Receiver<ReviewItem> {
        self.to_infer.1.clone()
    }

    pub fn from_infer_tx(&self) -> Sender<ReviewResult> {
        self.from_infer.0.clone()
    }

    pub fn from_infer_rx(&self) -> Receiver<ReviewResult> {
        self.from_infer.1.clone()
    }
}
