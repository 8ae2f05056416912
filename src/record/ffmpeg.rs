//! MP4 clips through FFmpeg.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::util::format::pixel::Pixel;

use super::clip::{ClipCodec, ClipReader, ClipWriter};
use crate::frame::{Frame, FrameShape};

#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegClipCodec;

impl ClipCodec for FfmpegClipCodec {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn create(&self, path: &Path, shape: FrameShape, fps: u32) -> Result<Box<dyn ClipWriter>> {
        Ok(Box::new(FfmpegClipWriter::new(path, shape, fps)?))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn ClipReader>> {
        Ok(Box::new(FfmpegClipReader::new(path)?))
    }
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

struct FfmpegClipWriter {
    path: PathBuf,
    shape: FrameShape,
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    next_pts: i64,
}

// SAFETY: every FFmpeg context here is owned by the writer and only touched
// through `&mut self`; none is shared with another thread.
unsafe impl Send for FfmpegClipWriter {}

impl FfmpegClipWriter {
    fn new(path: &Path, shape: FrameShape, fps: u32) -> Result<Self> {
        if !shape.is_rgb8() {
            bail!("MP4 clips need RGB8 frames, got {shape}");
        }
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("open output {}", path.display()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("MPEG-4 encoder unavailable"))?;

        let mut stream = output.add_stream(codec).context("add video stream")?;
        let stream_index = stream.index();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        let encoder_time_base = ffmpeg::Rational::new(1, fps.max(1) as i32);
        encoder.set_width(shape.width);
        encoder.set_height(shape.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(encoder_time_base);
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(fps.max(1) as i32, 1)));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).context("open MPEG-4 encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output
            .write_header()
            .with_context(|| format!("write header of {}", path.display()))?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("video stream vanished after header"))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            Pixel::RGB24,
            shape.width,
            shape.height,
            Pixel::YUV420P,
            shape.width,
            shape.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            path: path.to_path_buf(),
            shape,
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            next_pts: 0,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .with_context(|| format!("write packet to {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl ClipWriter for FfmpegClipWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.shape() != self.shape {
            bail!(
                "{}: frame shape {} does not match clip shape {}",
                self.path.display(),
                frame.shape(),
                self.shape
            );
        }
        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, self.shape.width, self.shape.height);
        let row_bytes = self.shape.row_bytes();
        let stride = rgb.stride(0);
        let src = frame.as_bytes();
        let dst = rgb.data_mut(0);
        for row in 0..self.shape.height as usize {
            dst[row * stride..row * stride + row_bytes]
                .copy_from_slice(&src[row * row_bytes..(row + 1) * row_bytes]);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .context("scale frame to YUV")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;
        self.encoder
            .send_frame(&yuv)
            .context("send frame to encoder")?;
        self.drain_packets()
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.encoder.send_eof().context("flush encoder")?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .with_context(|| format!("write trailer of {}", self.path.display()))
    }
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

struct FfmpegClipReader {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    shape: FrameShape,
    fps: u32,
    eof: bool,
}

// SAFETY: as for the writer, the contexts are exclusively owned.
unsafe impl Send for FfmpegClipReader {}

impl FfmpegClipReader {
    fn new(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open clip '{}' with ffmpeg", path.display()))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
        let stream_index = stream.index();
        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            (rate.numerator() / rate.denominator()).max(1) as u32
        } else {
            30
        };
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;
        let shape = FrameShape::rgb8(decoder.width(), decoder.height());

        Ok(Self {
            input,
            decoder,
            scaler,
            stream_index,
            shape,
            fps,
            eof: false,
        })
    }
}

impl ClipReader for FfmpegClipReader {
    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb)
                    .context("scale frame to RGB")?;
                return Ok(Some(Frame::new(self.shape, frame_to_pixels(&rgb, self.shape)?)?));
            }
            if self.eof {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("send packet to ffmpeg decoder")?;
                    }
                }
                None => {
                    self.decoder.send_eof().context("flush decoder")?;
                    self.eof = true;
                }
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video, shape: FrameShape) -> Result<Vec<u8>> {
    let row_bytes = shape.row_bytes();
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok(data[..shape.byte_len()].to_vec());
    }

    let mut pixels = Vec::with_capacity(shape.byte_len());
    for row in 0..shape.height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok(pixels)
}
