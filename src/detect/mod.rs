//! Object/motion detection.
//!
//! Backends implement `DetectorBackend`; the scheduler and file review share
//! one backend instance through the `BackendRegistry`.

mod annotate;
mod backend;
pub mod backends;
mod registry;
mod result;
mod verify;

pub use annotate::annotate;
pub use backend::{DetectionCapability, DetectorBackend, SourceKey};
pub use backends::{MotionBackend, StubBackend, StubControl};
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{BoundingBox, Detection};
pub use verify::{in_region, inspect, reverify, REVERIFY_PADDING};
