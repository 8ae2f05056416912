//! RTSP frame source.
//!
//! Real cameras go through GStreamer (`rtsp-gstreamer` feature), scaled to
//! the configured frame shape. `stub://` URLs produce a synthetic scene
//! instead: a noisy static background with an intruder block that walks
//! across the frame every so often. Query parameters tune the stub:
//!
//! - `fps=<n>`: native frame rate of the synthetic camera (default 15)
//! - `fail_after=<n>`: drop the stream after `n` frames, to exercise reconnects
//! - `intruder_every=<n>`: frames between intruder appearances (default 300)

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::frame::{Frame, FrameShape};

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Shape every delivered frame is scaled to.
    pub shape: FrameShape,
}

/// RTSP frame source.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)?),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("{}: RTSP requires the rtsp-gstreamer feature", config.url)
            }
        }
    }

    /// Frames delivered since creation, across reconnects.
    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.frames_total,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.frame_count,
        }
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.config.url.clone(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    native_fps: u32,
    fail_after: Option<u64>,
    intruder_every: u64,
    background: Vec<u8>,
    connected: bool,
    frames_since_connect: u64,
    frames_total: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        let mut native_fps = 15;
        let mut fail_after = None;
        let mut intruder_every = 300;
        if let Some((_, query)) = config.url.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("{}: malformed query '{pair}'", config.url))?;
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("{}: '{key}' must be an integer", config.url))?;
                match key {
                    "fps" => native_fps = parsed.clamp(1, 240) as u32,
                    "fail_after" => fail_after = Some(parsed),
                    "intruder_every" => intruder_every = parsed.max(2),
                    other => return Err(anyhow!("{}: unknown parameter '{other}'", config.url)),
                }
            }
        }

        let mut rng = rand::thread_rng();
        let background = (0..config.shape.byte_len())
            .map(|_| rng.gen_range(96u8..=112))
            .collect();

        Ok(Self {
            config,
            native_fps,
            fail_after,
            intruder_every,
            background,
            connected: false,
            frames_since_connect: 0,
            frames_total: 0,
            last_frame_at: None,
        })
    }

    /// Synthetic sources are always reachable.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.frames_since_connect = 0;
        self.last_frame_at = None;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("{}: not connected", self.config.url));
        }
        if self
            .fail_after
            .is_some_and(|limit| self.frames_since_connect >= limit)
        {
            self.connected = false;
            return Err(anyhow!("{}: synthetic stream dropped", self.config.url));
        }

        // Deliver at the camera's native rate.
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.native_fps));
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());

        let pixels = self.render();
        self.frames_since_connect += 1;
        self.frames_total += 1;
        Ok(Frame::new(self.config.shape, pixels)?)
    }

    /// Background plus, during an intruder pass, a bright block moving left
    /// to right along the lower half of the frame.
    fn render(&self) -> Vec<u8> {
        let mut pixels = self.background.clone();
        let shape = self.config.shape;
        let phase = self.frames_total % self.intruder_every;
        let pass_len = self.intruder_every / 2;
        if phase >= pass_len {
            return pixels;
        }

        let width = shape.width as usize;
        let height = shape.height as usize;
        let block_w = (width / 8).max(1);
        let block_h = (height / 4).max(1);
        let span = width.saturating_sub(block_w);
        let x0 = (span as u64 * phase / pass_len.max(1)) as usize;
        let y0 = height.saturating_sub(block_h) * 3 / 4;
        let bpp = shape.bytes_per_pixel();
        let row = shape.row_bytes();
        for y in y0..(y0 + block_h).min(height) {
            let start = y * row + x0 * bpp;
            let end = (start + block_w * bpp).min((y + 1) * row);
            pixels[start..end].fill(0xF0);
        }
        pixels
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    frame_count: u64,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        if !config.shape.is_rgb8() {
            anyhow::bail!(
                "{}: GStreamer ingest delivers RGB8 frames, configured shape is {}",
                config.url,
                config.shape
            );
        }
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            appsink: None,
            frame_count: 0,
            last_error: None,
        })
    }

    /// Build a fresh pipeline; any previous one is torn down first.
    fn connect(&mut self) -> Result<()> {
        if let Some(old) = self.pipeline.take() {
            let _ = old.set_state(gstreamer::State::Null);
        }
        self.appsink = None;
        self.last_error = None;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.config.url, self.config.shape.width, self.config.shape.height
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("RtspSource: connected to {}", self.config.url);
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}: {err}", self.config.url));
        }
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| anyhow!("{}: not connected", self.config.url))?;

        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_seconds(5))
            .ok_or_else(|| anyhow!("{}: RTSP stream stalled", self.config.url))?;
        let pixels = sample_to_pixels(&sample, self.config.shape)?;
        self.frame_count += 1;
        Ok(Frame::new(self.config.shape, pixels)?)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample, shape: FrameShape) -> Result<Vec<u8>> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;
    if info.width() != shape.width || info.height() != shape.height {
        anyhow::bail!(
            "RTSP sample is {}x{}, expected {}x{}",
            info.width(),
            info.height(),
            shape.width,
            shape.height
        );
    }

    let row_bytes = shape.row_bytes();
    let stride = info.stride()[0] as usize;
    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(data[..shape.byte_len()].to_vec());
    }

    let mut pixels = Vec::with_capacity(shape.byte_len());
    for row in 0..shape.height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok(pixels)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
