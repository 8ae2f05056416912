//! Clip recording.
//!
//! While a camera's record flag is set, its `ClipRecorder` drains the ring
//! buffer from the oldest end (pre-roll first) into clip files, chunked at a
//! maximum duration. Every finished clip is announced with a `ClipNotice`.

mod clip;
#[cfg(feature = "clip-ffmpeg")]
mod ffmpeg;
mod recorder;

use std::sync::Arc;

use anyhow::{bail, Result};

pub use clip::{ClipCodec, ClipNotice, ClipReader, ClipWriter, RawClipCodec};
#[cfg(feature = "clip-ffmpeg")]
pub use ffmpeg::FfmpegClipCodec;
pub use recorder::{ClipRecorder, RecorderSettings, RecorderState, RecorderStep};

/// Look up a codec by configured name (`raw` or `mp4`).
pub fn codec_by_name(name: &str) -> Result<Arc<dyn ClipCodec>> {
    match name {
        "raw" | "rwc" => Ok(Arc::new(RawClipCodec)),
        #[cfg(feature = "clip-ffmpeg")]
        "mp4" | "ffmpeg" => Ok(Arc::new(FfmpegClipCodec)),
        #[cfg(not(feature = "clip-ffmpeg"))]
        "mp4" | "ffmpeg" => bail!("clip codec '{name}' requires the clip-ffmpeg feature"),
        other => bail!("unknown clip codec '{other}'"),
    }
}
