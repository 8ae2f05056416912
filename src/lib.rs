//! Ringwatch surveillance core
//!
//! Multi-camera capture, recording and detection built around one shared
//! ring buffer per camera.
//!
//! # Architecture
//!
//! Every long-running activity is a supervised unit on its own thread:
//!
//! 1. **Ingest** (`ingest-<id>`): decodes a camera stream into its ring buffer.
//! 2. **Record** (`record-<id>`): drains the buffer into contiguous clips.
//! 3. **Detect** (`detect`): one time-budgeted pass over all cameras per
//!    cycle, driving the record/alarm hysteresis, then spends what is left of
//!    the cycle on file review.
//! 4. **Review** (`review-decode`, `review-reassemble`): re-decodes finished
//!    clips and writes annotated copies.
//! 5. **Notify** and **control**: snapshots, alarm escalation, arm/disarm.
//!
//! # Module Structure
//!
//! - `frame`, `buffer`: frame layout and the shared ring buffer
//! - `camera`: per-camera and system-wide shared state
//! - `ingest`, `record`, `review`, `scheduler`: the pipeline stages
//! - `detect`: detector backends and region/reverify helpers
//! - `notify`, `autoarm`, `state_store`: operator-facing side
//! - `supervisor`, `runtime`, `config`: process wiring

pub mod autoarm;
pub mod buffer;
pub mod camera;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod media;
pub mod notify;
pub mod record;
pub mod review;
pub mod runtime;
pub mod scheduler;
pub mod state_store;
pub mod supervisor;

pub use buffer::{BufferError, RingFrameBuffer};
pub use camera::{CameraId, CameraSettings, CameraState, SharedState};
pub use config::RingwatchConfig;
pub use error::{FailureKind, PipelineError};
pub use frame::{Frame, FrameShape, PixelDepth};
pub use scheduler::{CycleReport, DetectionScheduler, SchedulerSettings};
pub use supervisor::{Supervisor, SupervisorSettings};
