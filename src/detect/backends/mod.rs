pub mod motion;
pub mod stub;

pub use motion::{MotionBackend, MOTION_CLASS};
pub use stub::{StubBackend, StubControl};
