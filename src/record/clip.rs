//! Clip containers.
//!
//! `ClipCodec` is the seam between recording/review and whatever actually
//! encodes video. The built-in `RawClipCodec` stores frames uncompressed:
//!
//! ```text
//! "RWCLIP01" | width u32 LE | height u32 LE | channels u8 | depth u8 | fps u32 LE | frame* |
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};

use crate::camera::CameraId;
use crate::frame::{Frame, FrameShape, PixelDepth};

const MAGIC: &[u8; 8] = b"RWCLIP01";
const HEADER_LEN: usize = 8 + 4 + 4 + 1 + 1 + 4;

/// A finished segment handed from the recorder to file review.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipNotice {
    pub camera: CameraId,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    pub shape: FrameShape,
    pub fps: u32,
    pub frames: u64,
}

pub trait ClipWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. The file is complete only after this returns.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait ClipReader: Send {
    fn shape(&self) -> FrameShape;

    fn fps(&self) -> u32;

    /// `Ok(None)` at end of clip.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

pub trait ClipCodec: Send + Sync {
    /// File extension without the dot.
    fn extension(&self) -> &'static str;

    fn create(&self, path: &Path, shape: FrameShape, fps: u32) -> Result<Box<dyn ClipWriter>>;

    fn open(&self, path: &Path) -> Result<Box<dyn ClipReader>>;
}

// ----------------------------------------------------------------------------
// Raw container
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct RawClipCodec;

impl ClipCodec for RawClipCodec {
    fn extension(&self) -> &'static str {
        "rwc"
    }

    fn create(&self, path: &Path, shape: FrameShape, fps: u32) -> Result<Box<dyn ClipWriter>> {
        let file =
            File::create(path).with_context(|| format!("create clip {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&shape.width.to_le_bytes());
        header.extend_from_slice(&shape.height.to_le_bytes());
        header.push(shape.channels);
        header.push(shape.depth.code());
        header.extend_from_slice(&fps.to_le_bytes());
        out.write_all(&header)
            .with_context(|| format!("write header of {}", path.display()))?;
        Ok(Box::new(RawClipWriter {
            out,
            shape,
            path: path.to_path_buf(),
        }))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn ClipReader>> {
        let file = File::open(path).with_context(|| format!("open clip {}", path.display()))?;
        let mut input = BufReader::new(file);
        let mut header = [0u8; HEADER_LEN];
        input
            .read_exact(&mut header)
            .with_context(|| format!("read header of {}", path.display()))?;
        if &header[..8] != MAGIC {
            bail!("{} is not a raw clip", path.display());
        }
        let width = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let height = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let channels = header[16];
        let depth = PixelDepth::from_code(header[17])
            .ok_or_else(|| anyhow!("{}: unknown pixel depth {}", path.display(), header[17]))?;
        let fps = u32::from_le_bytes([header[18], header[19], header[20], header[21]]);
        let shape = FrameShape::new(height, width, channels, depth);
        if shape.is_empty() {
            bail!("{}: empty frame shape {shape}", path.display());
        }
        Ok(Box::new(RawClipReader {
            input,
            shape,
            fps,
            path: path.to_path_buf(),
        }))
    }
}

struct RawClipWriter {
    out: BufWriter<File>,
    shape: FrameShape,
    path: PathBuf,
}

impl ClipWriter for RawClipWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.shape() != self.shape {
            bail!(
                "{}: frame shape {} does not match clip shape {}",
                self.path.display(),
                frame.shape(),
                self.shape
            );
        }
        self.out
            .write_all(frame.as_bytes())
            .with_context(|| format!("write frame to {}", self.path.display()))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let RawClipWriter { out, path, .. } = *self;
        let file = out
            .into_inner()
            .map_err(|err| anyhow!("flush {}: {}", path.display(), err.error()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", path.display()))
    }
}

struct RawClipReader {
    input: BufReader<File>,
    shape: FrameShape,
    fps: u32,
    path: PathBuf,
}

impl ClipReader for RawClipReader {
    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut data = vec![0u8; self.shape.byte_len()];
        let mut filled = 0;
        while filled < data.len() {
            match self.input.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("read {}", self.path.display()))
                }
            }
        }
        match filled {
            0 => Ok(None),
            n if n == data.len() => Ok(Some(Frame::new(self.shape, data)?)),
            n => bail!(
                "{}: truncated trailing frame ({n} of {} bytes)",
                self.path.display(),
                data.len()
            ),
        }
    }
}
