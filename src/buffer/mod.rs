//! Fixed-capacity circular frame buffer shared between one writer and many
//! readers.
//!
//! Each camera owns one `RingFrameBuffer`. The ingestor appends, the clip
//! recorder drains from the oldest end, and the detection scheduler samples
//! the newest end. All head/tail/count arithmetic lives behind a single
//! mutex; the only way to touch the storage is through `RingGuard`.
//!
//! Appending to a full buffer silently overwrites the oldest frame. The
//! buffer is a bounded producer-driven cache, not a queue: writers never
//! block on readers.
//!
//! Reads copy the slot out. A logical index is only meaningful for the
//! duration of one lock hold; a concurrent append may evict the frame an
//! earlier index pointed at. Use `sequence()` to tell whether anything new
//! arrived between two reads.
//!
//! `latest()` is the sampling read: it returns the most recently appended
//! frame even after a drain has consumed it, because the slot keeps its bytes
//! until the next append overwrites it.

mod region;

use std::ops::{Bound, RangeBounds};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::frame::{Frame, FrameShape};
use region::SharedRegion;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("ring buffer is empty")]
    EmptyBuffer,
    #[error("index {index} is out of range for a buffer holding {len} frames")]
    IndexOutOfRange { index: isize, len: usize },
    #[error("frame shape {found} does not match buffer shape {expected}")]
    ShapeMismatch {
        expected: FrameShape,
        found: FrameShape,
    },
    #[error("ring buffer capacity and frame size must be non-zero")]
    ZeroCapacity,
    #[error("failed to map ring buffer storage: {0}")]
    Region(String),
    #[error("ring buffer lock poisoned")]
    Poisoned,
}

struct RingState {
    head: usize,
    tail: usize,
    count: usize,
    sequence: u64,
    last_written: Option<usize>,
    region: SharedRegion,
}

pub struct RingFrameBuffer {
    shape: FrameShape,
    capacity: usize,
    item_size: usize,
    state: Mutex<RingState>,
}

impl RingFrameBuffer {
    /// Allocate storage for `capacity` frames of `shape`.
    pub fn new(capacity: usize, shape: FrameShape) -> Result<Self, BufferError> {
        let item_size = shape.byte_len();
        if capacity == 0 || item_size == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        let region = SharedRegion::new(capacity * item_size)?;
        debug_assert_eq!(region.len(), capacity * item_size);
        Ok(Self {
            shape,
            capacity,
            item_size,
            state: Mutex::new(RingState {
                head: 0,
                tail: 0,
                count: 0,
                sequence: 0,
                last_written: None,
                region,
            }),
        })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Take the buffer lock. Several operations on one guard observe a
    /// consistent buffer.
    pub fn lock(&self) -> Result<RingGuard<'_>, BufferError> {
        let state = self.state.lock().map_err(|_| BufferError::Poisoned)?;
        Ok(RingGuard { ring: self, state })
    }

    pub fn append(&self, frame: &Frame) -> Result<(), BufferError> {
        self.lock()?.append(frame)
    }

    pub fn pop_oldest(&self) -> Result<Frame, BufferError> {
        self.lock()?.pop_oldest()
    }

    pub fn pop_newest(&self) -> Result<Frame, BufferError> {
        self.lock()?.pop_newest()
    }

    /// `0` is the oldest frame, `-1` the newest.
    pub fn get(&self, index: isize) -> Result<Frame, BufferError> {
        self.lock()?.get(index)
    }

    pub fn get_range<R: RangeBounds<usize>>(&self, range: R) -> Result<Vec<Frame>, BufferError> {
        Ok(self.lock()?.get_range(range))
    }

    pub fn newest(&self) -> Result<Frame, BufferError> {
        self.lock()?.newest()
    }

    /// Most recently appended frame, whether or not it was consumed since.
    pub fn latest(&self) -> Result<Frame, BufferError> {
        self.lock()?.latest()
    }

    pub fn len(&self) -> Result<usize, BufferError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BufferError> {
        Ok(self.len()? == 0)
    }

    /// Total number of frames ever appended.
    pub fn sequence(&self) -> Result<u64, BufferError> {
        Ok(self.lock()?.sequence())
    }
}

impl std::fmt::Debug for RingFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingFrameBuffer")
            .field("shape", &self.shape)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Exclusive access to a ring buffer for the lifetime of the guard.
pub struct RingGuard<'a> {
    ring: &'a RingFrameBuffer,
    state: MutexGuard<'a, RingState>,
}

impl RingGuard<'_> {
    pub fn len(&self) -> usize {
        self.state.count
    }

    pub fn is_empty(&self) -> bool {
        self.state.count == 0
    }

    pub fn sequence(&self) -> u64 {
        self.state.sequence
    }

    pub fn append(&mut self, frame: &Frame) -> Result<(), BufferError> {
        if frame.shape() != self.ring.shape {
            return Err(BufferError::ShapeMismatch {
                expected: self.ring.shape,
                found: frame.shape(),
            });
        }
        let capacity = self.ring.capacity;
        let item_size = self.ring.item_size;
        let state = &mut *self.state;
        state
            .region
            .slot_mut(state.tail, item_size)
            .copy_from_slice(frame.as_bytes());
        state.last_written = Some(state.tail);
        state.tail = (state.tail + 1) % capacity;
        if state.count < capacity {
            state.count += 1;
        } else {
            state.head = state.tail;
        }
        state.sequence += 1;
        Ok(())
    }

    pub fn pop_oldest(&mut self) -> Result<Frame, BufferError> {
        if self.state.count == 0 {
            return Err(BufferError::EmptyBuffer);
        }
        let slot = self.state.head;
        let frame = self.copy_slot(slot);
        let state = &mut *self.state;
        state.head = (state.head + 1) % self.ring.capacity;
        state.count -= 1;
        Ok(frame)
    }

    pub fn pop_newest(&mut self) -> Result<Frame, BufferError> {
        if self.state.count == 0 {
            return Err(BufferError::EmptyBuffer);
        }
        let capacity = self.ring.capacity;
        let slot = (self.state.tail + capacity - 1) % capacity;
        let frame = self.copy_slot(slot);
        let state = &mut *self.state;
        state.tail = slot;
        state.count -= 1;
        Ok(frame)
    }

    pub fn get(&self, index: isize) -> Result<Frame, BufferError> {
        let slot = self.slot_for(index)?;
        Ok(self.copy_slot(slot))
    }

    pub fn newest(&self) -> Result<Frame, BufferError> {
        if self.is_empty() {
            return Err(BufferError::EmptyBuffer);
        }
        self.get(-1)
    }

    pub fn latest(&self) -> Result<Frame, BufferError> {
        let slot = self.state.last_written.ok_or(BufferError::EmptyBuffer)?;
        Ok(self.copy_slot(slot))
    }

    /// Frames at logical positions in `range`, oldest first. The range is
    /// clamped to the current occupancy.
    pub fn get_range<R: RangeBounds<usize>>(&self, range: R) -> Vec<Frame> {
        let len = self.state.count;
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .min(len);
        (start..end)
            .map(|offset| self.copy_slot((self.state.head + offset) % self.ring.capacity))
            .collect()
    }

    fn slot_for(&self, index: isize) -> Result<usize, BufferError> {
        let len = self.state.count;
        let capacity = self.ring.capacity;
        let out_of_range = BufferError::IndexOutOfRange { index, len };
        if index >= 0 {
            let offset = index as usize;
            if offset >= len {
                return Err(out_of_range);
            }
            Ok((self.state.head + offset) % capacity)
        } else {
            let back = index.unsigned_abs();
            if back > len {
                return Err(out_of_range);
            }
            Ok((self.state.tail + capacity - back) % capacity)
        }
    }

    fn copy_slot(&self, slot: usize) -> Frame {
        let bytes = self.state.region.slot(slot, self.ring.item_size).to_vec();
        Frame::from_trusted(self.ring.shape, bytes)
    }
}
