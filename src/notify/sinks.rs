use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use super::{NotificationSink, Notice};
use crate::clock::Clock;
use crate::frame::{Frame, PixelDepth};
use crate::media::MediaLayout;

/// Writes every notice to the log.
#[derive(Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&mut self, notice: &Notice) -> Result<()> {
        match notice {
            Notice::UnitFailed { .. } | Notice::RelayFailed { .. } => {
                log::error!("notice: {}", notice.summary())
            }
            Notice::AlarmPending { .. } | Notice::AlarmTriggered => {
                log::warn!("notice: {}", notice.summary())
            }
            _ => log::info!("notice: {}", notice.summary()),
        }
        Ok(())
    }
}

/// Saves snapshot frames under `snapshots/<camera>/`.
pub struct SnapshotSink {
    layout: MediaLayout,
    clock: Arc<dyn Clock>,
    last: Option<PathBuf>,
}

impl SnapshotSink {
    pub fn new(layout: MediaLayout, clock: Arc<dyn Clock>) -> Self {
        Self {
            layout,
            clock,
            last: None,
        }
    }

    /// Path of the most recently written snapshot.
    pub fn last_written(&self) -> Option<&Path> {
        self.last.as_deref()
    }
}

impl NotificationSink for SnapshotSink {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn deliver(&mut self, notice: &Notice) -> Result<()> {
        let Notice::Snapshot { camera, frame, caption } = notice else {
            return Ok(());
        };
        let path = self
            .layout
            .new_snapshot_path(*camera, self.clock.now(), SNAPSHOT_EXT)?;
        write_snapshot(&path, frame)?;
        log::info!("camera {camera}: snapshot \"{caption}\" saved to {}", path.display());
        self.last = Some(path);
        Ok(())
    }
}

#[cfg(feature = "snapshot-png")]
const SNAPSHOT_EXT: &str = "png";
#[cfg(not(feature = "snapshot-png"))]
const SNAPSHOT_EXT: &str = "ppm";

#[cfg(feature = "snapshot-png")]
fn write_snapshot(path: &Path, frame: &Frame) -> Result<()> {
    let shape = frame.shape();
    let color = match (shape.channels, shape.depth) {
        (3, PixelDepth::U8) => image::ExtendedColorType::Rgb8,
        (1, PixelDepth::U8) => image::ExtendedColorType::L8,
        _ => return Err(anyhow!("cannot encode {shape} frame as png")),
    };
    image::save_buffer(path, frame.as_bytes(), shape.width, shape.height, color)
        .with_context(|| format!("write {}", path.display()))
}

/// Binary PPM (P6) for RGB, PGM (P5) for single-channel frames.
#[cfg(not(feature = "snapshot-png"))]
fn write_snapshot(path: &Path, frame: &Frame) -> Result<()> {
    use std::fs::File;
    use std::io::{BufWriter, Write};

    let shape = frame.shape();
    let magic = match (shape.channels, shape.depth) {
        (3, PixelDepth::U8) => "P6",
        (1, PixelDepth::U8) => "P5",
        _ => return Err(anyhow!("cannot encode {shape} frame as pnm")),
    };
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write!(out, "{magic}\n{} {}\n255\n", shape.width, shape.height)?;
    out.write_all(frame.as_bytes())?;
    out.flush()?;
    Ok(())
}
