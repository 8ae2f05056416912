//! Per-camera and system-wide shared state.
//!
//! Every mutable field here has exactly one writing component; everyone else
//! only reads. Flags and counters are plain atomics, so readers see a whole
//! value or the previous one, never a partial update.
//!
//! | Field | Writer |
//! |---|---|
//! | `SystemState::armed`, `CameraState::armed` | `CommandHandler` |
//! | `SystemState::alarm` | raised by `DetectionScheduler`, lowered by `AlarmEscalator` |
//! | `CameraState::record_flag`, `CameraState::record_counter` | `DetectionScheduler` |
//! | `CameraState::segment` | `ClipRecorder` |
//! | ring buffer contents | `StreamIngestor` appends, `ClipRecorder` drains |

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::buffer::{BufferError, RingFrameBuffer};
use crate::frame::FrameShape;

/// Camera identifier. `0` is reserved for the system as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl CameraId {
    pub const SYSTEM: CameraId = CameraId(0);
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Region of interest
// ----------------------------------------------------------------------------

/// Polygon in normalized `[0, 1]` coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionOfInterest {
    points: Vec<(f32, f32)>,
}

impl RegionOfInterest {
    pub fn new(points: Vec<(f32, f32)>) -> Result<Self> {
        if points.len() < 3 {
            return Err(anyhow!(
                "region polygon needs at least 3 points, got {}",
                points.len()
            ));
        }
        if let Some((x, y)) = points
            .iter()
            .find(|(x, y)| !(0.0..=1.0).contains(x) || !(0.0..=1.0).contains(y))
        {
            return Err(anyhow!("region point ({x}, {y}) is outside [0, 1]"));
        }
        Ok(Self { points })
    }

    pub fn full_frame() -> Self {
        Self {
            points: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)],
        }
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    /// Scale to pixel coordinates of a `width`x`height` frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelPolygon {
        PixelPolygon {
            points: self
                .points
                .iter()
                .map(|(x, y)| (x * width as f32, y * height as f32))
                .collect(),
        }
    }
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self::full_frame()
    }
}

/// Polygon in pixel coordinates of one frame shape.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelPolygon {
    points: Vec<(f32, f32)>,
}

impl PixelPolygon {
    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    /// Even-odd point test. Points on the right/bottom edge of a full-frame
    /// polygon count as inside.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.points[i];
            let (xj, yj) = self.points[j];
            if on_segment((xi, yi), (xj, yj), (x, y)) {
                return true;
            }
            if (yi > y) != (yj > y) {
                let cross_x = (xj - xi) * (y - yi) / (yj - yi) + xi;
                if x < cross_x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn on_segment(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > 1e-3 {
        return false;
    }
    p.0 >= a.0.min(b.0) - 1e-3
        && p.0 <= a.0.max(b.0) + 1e-3
        && p.1 >= a.1.min(b.1) - 1e-3
        && p.1 <= a.1.max(b.1) + 1e-3
}

// ----------------------------------------------------------------------------
// Camera settings and state
// ----------------------------------------------------------------------------

/// Immutable per-camera configuration.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub id: CameraId,
    pub name: String,
    pub source_uri: String,
    pub shape: FrameShape,
    /// Target frame rate written to the ring buffer and clips.
    pub fps: u32,
    pub detect: bool,
    pub record: bool,
    pub class_filter: Vec<u32>,
    pub confidence: f32,
    pub region: RegionOfInterest,
    /// Armed flag at startup, before persisted state is applied.
    pub armed: bool,
}

impl CameraSettings {
    /// Minimal settings for a camera with default detection parameters.
    pub fn new(id: u32, source_uri: impl Into<String>, shape: FrameShape) -> Self {
        Self {
            id: CameraId(id),
            name: format!("camera {id}"),
            source_uri: source_uri.into(),
            shape,
            fps: 30,
            detect: true,
            record: true,
            class_filter: vec![0],
            confidence: 0.45,
            region: RegionOfInterest::full_frame(),
            armed: true,
        }
    }
}

/// The clip a recorder currently has open.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    pub frames: u64,
}

pub struct CameraState {
    settings: CameraSettings,
    buffer: Arc<RingFrameBuffer>,
    armed: AtomicBool,
    record_flag: AtomicBool,
    record_counter: AtomicU32,
    segment: Mutex<Option<SegmentInfo>>,
}

impl CameraState {
    pub fn new(settings: CameraSettings, capacity: usize) -> Result<Self, BufferError> {
        let buffer = Arc::new(RingFrameBuffer::new(capacity, settings.shape)?);
        Ok(Self {
            armed: AtomicBool::new(settings.armed),
            settings,
            buffer,
            record_flag: AtomicBool::new(false),
            record_counter: AtomicU32::new(0),
            segment: Mutex::new(None),
        })
    }

    pub fn id(&self) -> CameraId {
        self.settings.id
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &Arc<RingFrameBuffer> {
        &self.buffer
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Written only by the command handler.
    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release);
    }

    pub fn record_flag(&self) -> bool {
        self.record_flag.load(Ordering::Acquire)
    }

    /// Written only by the detection scheduler.
    pub fn set_record_flag(&self, on: bool) {
        self.record_flag.store(on, Ordering::Release);
    }

    pub fn record_counter(&self) -> u32 {
        self.record_counter.load(Ordering::Acquire)
    }

    /// Written only by the detection scheduler.
    pub fn set_record_counter(&self, value: u32) {
        self.record_counter.store(value, Ordering::Release);
    }

    pub fn segment(&self) -> Option<SegmentInfo> {
        match self.segment.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Written only by the clip recorder.
    pub fn set_segment(&self, segment: Option<SegmentInfo>) {
        match self.segment.lock() {
            Ok(mut guard) => *guard = segment,
            Err(poisoned) => *poisoned.into_inner() = segment,
        }
    }
}

impl fmt::Debug for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraState")
            .field("id", &self.settings.id)
            .field("armed", &self.is_armed())
            .field("record_flag", &self.record_flag())
            .field("record_counter", &self.record_counter())
            .finish()
    }
}

/// System-wide flags consulted by every camera's gating logic.
#[derive(Debug)]
pub struct SystemState {
    armed: AtomicBool,
    alarm: AtomicBool,
}

impl SystemState {
    pub fn new(armed: bool) -> Self {
        Self {
            armed: AtomicBool::new(armed),
            alarm: AtomicBool::new(false),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release);
    }

    pub fn alarm(&self) -> bool {
        self.alarm.load(Ordering::Acquire)
    }

    /// Returns true if the alarm was not already raised.
    pub fn raise_alarm(&self) -> bool {
        !self.alarm.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the alarm was raised.
    pub fn clear_alarm(&self) -> bool {
        self.alarm.swap(false, Ordering::AcqRel)
    }
}

/// Everything the units share. Cameras keep insertion order.
#[derive(Debug)]
pub struct SharedState {
    system: SystemState,
    cameras: Vec<Arc<CameraState>>,
}

impl SharedState {
    pub fn new(system_armed: bool, cameras: Vec<CameraState>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for camera in &cameras {
            if camera.id() == CameraId::SYSTEM {
                return Err(anyhow!("camera id 0 is reserved for the system"));
            }
            if !seen.insert(camera.id()) {
                return Err(anyhow!("duplicate camera id {}", camera.id()));
            }
        }
        Ok(Self {
            system: SystemState::new(system_armed),
            cameras: cameras.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn system(&self) -> &SystemState {
        &self.system
    }

    pub fn cameras(&self) -> &[Arc<CameraState>] {
        &self.cameras
    }

    pub fn camera(&self, id: CameraId) -> Option<&Arc<CameraState>> {
        self.cameras.iter().find(|camera| camera.id() == id)
    }

    /// Both the system and the camera must be armed.
    pub fn is_armed(&self, camera: &CameraState) -> bool {
        self.system.is_armed() && camera.is_armed()
    }
}
