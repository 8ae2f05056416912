//! Frame ingestion.
//!
//! A `FrameSource` delivers fixed-shape frames from one camera. The
//! `StreamIngestor` owns a source, paces its frames into the camera's ring
//! buffer at the target record rate and reconnects forever on failure.

mod ingestor;
mod pacer;
pub mod rtsp;

use anyhow::Result;

use crate::camera::CameraSettings;
use crate::frame::Frame;

pub use ingestor::{IngestPhase, StreamIngestor};
pub use pacer::FramePacer;
pub use rtsp::{RtspConfig, RtspSource};

/// A camera connection.
pub trait FrameSource: Send {
    /// (Re)establish the stream. Called again after every failure.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Human-readable origin for log lines.
    fn describe(&self) -> String;
}

/// Open the source configured for a camera.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(RtspSource::new(RtspConfig {
        url: settings.source_uri.clone(),
        shape: settings.shape,
    })?))
}
