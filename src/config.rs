use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autoarm::ArmSchedule;
use crate::camera::{CameraSettings, RegionOfInterest};
use crate::frame::{FrameShape, PixelDepth};
use crate::record::RecorderSettings;
use crate::scheduler::SchedulerSettings;
use crate::supervisor::SupervisorSettings;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_DB_FILE: &str = "ringwatch.db";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_PRE_ROLL_SECS: u32 = 5;
const DEFAULT_MAX_CLIP_SECS: u64 = 30 * 60;
const DEFAULT_IDLE_POLL_MS: u64 = 2000;
const DEFAULT_EMPTY_WAIT_MS: u64 = 50;
const DEFAULT_CODEC: &str = "raw";
const DEFAULT_CYCLE_MS: u64 = 1000;
const DEFAULT_DETECTIONS_FOR_EVENT: u32 = 5;
const DEFAULT_DETECTOR: &str = "motion";
const DEFAULT_INITIAL_INFERENCE_MS: u64 = 20;
const DEFAULT_REVIEW_CAPACITY: usize = 100;
const DEFAULT_RESTART_BACKOFF_SECS: u64 = 10;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SUPERVISOR_POLL_MS: u64 = 1000;
const DEFAULT_REPORT_SECS: u64 = 5;
const DEFAULT_ALARM_GRACE_SECS: u64 = 30;
const DEFAULT_RECONNECT_SECS: u64 = 10;
const DEFAULT_CONFIDENCE: f32 = 0.45;
const DEFAULT_MQTT_CLIENT_ID: &str = "ringwatchd";
const DEFAULT_MQTT_PREFIX: &str = "ringwatch";

#[derive(Debug, Deserialize, Default)]
struct RingwatchConfigFile {
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    system_armed: Option<bool>,
    record: Option<RecordConfigFile>,
    detection: Option<DetectionConfigFile>,
    review: Option<ReviewConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    alarm: Option<AlarmConfigFile>,
    mqtt: Option<MqttConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    autoarm: Option<Vec<AutoArmConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordConfigFile {
    fps: Option<u32>,
    pre_roll_secs: Option<u32>,
    max_clip_secs: Option<u64>,
    idle_poll_ms: Option<u64>,
    empty_wait_ms: Option<u64>,
    codec: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    cycle_ms: Option<u64>,
    detections_for_event: Option<u32>,
    backend: Option<String>,
    reverify: Option<bool>,
    recheck: Option<bool>,
    initial_inference_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReviewConfigFile {
    enabled: Option<bool>,
    queue_capacity: Option<usize>,
    delete_raw: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    restart_backoff_secs: Option<u64>,
    stall_timeout_secs: Option<u64>,
    poll_ms: Option<u64>,
    report_secs: Option<u64>,
    reconnect_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlarmConfigFile {
    grace_secs: Option<u64>,
    relay_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: u32,
    name: Option<String>,
    url: String,
    width: u32,
    height: u32,
    channels: Option<u8>,
    fps: Option<u32>,
    detect: Option<bool>,
    record: Option<bool>,
    classes: Option<Vec<u32>>,
    confidence: Option<f32>,
    region: Option<Vec<(f32, f32)>>,
    armed: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AutoArmConfigFile {
    at: String,
    action: String,
    #[serde(default)]
    days: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub fps: u32,
    pub pre_roll_secs: u32,
    pub codec: String,
    pub recorder: RecorderSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub backend: String,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
    /// Remove the raw clip once its annotated copy is complete.
    pub delete_raw: bool,
}

#[derive(Debug, Clone)]
pub struct AlarmConfig {
    pub grace: Duration,
    pub relay_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RingwatchConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub system_armed: bool,
    pub record: RecordConfig,
    pub detection: DetectionConfig,
    pub review: ReviewConfig,
    pub supervisor: SupervisorSettings,
    /// Wait between failed camera connection attempts.
    pub reconnect_backoff: Duration,
    pub alarm: AlarmConfig,
    pub mqtt: Option<MqttConfig>,
    pub cameras: Vec<CameraSettings>,
    pub autoarm: Vec<ArmSchedule>,
}

impl RingwatchConfig {
    /// Read `path` (JSON or TOML by extension) if given, apply environment
    /// overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RingwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse config text directly, without environment overrides.
    pub fn from_text(raw: &str, is_toml: bool) -> Result<Self> {
        let file_cfg = parse_config(raw, is_toml)?;
        let cfg = Self::from_file(file_cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Ring buffer capacity: `pre_roll_secs` worth of frames at `fps`.
    pub fn buffer_capacity(&self, camera: &CameraSettings) -> usize {
        (self.record.pre_roll_secs as usize * camera.fps as usize).max(1)
    }

    fn from_file(file: RingwatchConfigFile) -> Result<Self> {
        let data_dir = file
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let db_path = file
            .db_path
            .unwrap_or_else(|| data_dir.join(DEFAULT_DB_FILE));

        let record_file = file.record.unwrap_or_default();
        let record = RecordConfig {
            fps: record_file.fps.unwrap_or(DEFAULT_FPS),
            pre_roll_secs: record_file.pre_roll_secs.unwrap_or(DEFAULT_PRE_ROLL_SECS),
            codec: record_file
                .codec
                .unwrap_or_else(|| DEFAULT_CODEC.to_string()),
            recorder: RecorderSettings {
                max_clip: Duration::from_secs(
                    record_file.max_clip_secs.unwrap_or(DEFAULT_MAX_CLIP_SECS),
                ),
                idle_poll: Duration::from_millis(
                    record_file.idle_poll_ms.unwrap_or(DEFAULT_IDLE_POLL_MS),
                ),
                empty_wait: Duration::from_millis(
                    record_file.empty_wait_ms.unwrap_or(DEFAULT_EMPTY_WAIT_MS),
                ),
            },
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionConfig {
            backend: detection_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            scheduler: SchedulerSettings {
                cycle: Duration::from_millis(detection_file.cycle_ms.unwrap_or(DEFAULT_CYCLE_MS)),
                detections_for_event: detection_file
                    .detections_for_event
                    .unwrap_or(DEFAULT_DETECTIONS_FOR_EVENT),
                reverify: detection_file.reverify.unwrap_or(true),
                recheck: detection_file.recheck.unwrap_or(true),
                initial_inference: Duration::from_millis(
                    detection_file
                        .initial_inference_ms
                        .unwrap_or(DEFAULT_INITIAL_INFERENCE_MS),
                ),
            },
        };

        let review_file = file.review.unwrap_or_default();
        let review = ReviewConfig {
            enabled: review_file.enabled.unwrap_or(true),
            queue_capacity: review_file.queue_capacity.unwrap_or(DEFAULT_REVIEW_CAPACITY),
            delete_raw: review_file.delete_raw.unwrap_or(false),
        };

        let supervisor_file = file.supervisor.unwrap_or_default();
        let supervisor = SupervisorSettings {
            restart_backoff: Duration::from_secs(
                supervisor_file
                    .restart_backoff_secs
                    .unwrap_or(DEFAULT_RESTART_BACKOFF_SECS),
            ),
            stall_timeout: Duration::from_secs(
                supervisor_file
                    .stall_timeout_secs
                    .unwrap_or(DEFAULT_STALL_TIMEOUT_SECS),
            ),
            poll_interval: Duration::from_millis(
                supervisor_file.poll_ms.unwrap_or(DEFAULT_SUPERVISOR_POLL_MS),
            ),
            report_interval: Duration::from_secs(
                supervisor_file.report_secs.unwrap_or(DEFAULT_REPORT_SECS),
            ),
        };
        let reconnect_backoff = Duration::from_secs(
            supervisor_file
                .reconnect_secs
                .unwrap_or(DEFAULT_RECONNECT_SECS),
        );

        let alarm_file = file.alarm.unwrap_or_default();
        let alarm = AlarmConfig {
            grace: Duration::from_secs(alarm_file.grace_secs.unwrap_or(DEFAULT_ALARM_GRACE_SECS)),
            relay_url: alarm_file.relay_url.filter(|url| !url.trim().is_empty()),
        };

        let mqtt = match file.mqtt {
            Some(mqtt) => Some(MqttConfig {
                broker: mqtt
                    .broker
                    .ok_or_else(|| anyhow!("mqtt.broker is required when [mqtt] is present"))?,
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_PREFIX.to_string()),
                username: mqtt.username,
                password: mqtt.password,
            }),
            None => None,
        };

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|camera| camera_settings(camera, record.fps))
            .collect::<Result<Vec<_>>>()?;

        let autoarm = file
            .autoarm
            .unwrap_or_default()
            .iter()
            .map(|entry| ArmSchedule::parse(&entry.at, &entry.action, &entry.days))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            data_dir,
            db_path,
            system_armed: file.system_armed.unwrap_or(true),
            record,
            detection,
            review,
            supervisor,
            reconnect_backoff,
            alarm,
            mqtt,
            cameras,
            autoarm,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("RINGWATCH_DATA_DIR") {
            if !dir.trim().is_empty() {
                let explicit_db = self.db_path != self.data_dir.join(DEFAULT_DB_FILE);
                self.data_dir = PathBuf::from(dir);
                if !explicit_db {
                    self.db_path = self.data_dir.join(DEFAULT_DB_FILE);
                }
            }
        }
        if let Ok(path) = std::env::var("RINGWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = PathBuf::from(path);
            }
        }
        if let Ok(cycle) = std::env::var("RINGWATCH_CYCLE_MS") {
            let ms: u64 = cycle
                .trim()
                .parse()
                .map_err(|_| anyhow!("RINGWATCH_CYCLE_MS must be an integer number of milliseconds"))?;
            self.detection.scheduler.cycle = Duration::from_millis(ms);
        }
        if let Ok(backend) = std::env::var("RINGWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detection.backend = backend.trim().to_string();
            }
        }
        if let Ok(broker) = std::env::var("RINGWATCH_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                match self.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker = broker,
                    None => {
                        self.mqtt = Some(MqttConfig {
                            broker,
                            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                            topic_prefix: DEFAULT_MQTT_PREFIX.to_string(),
                            username: None,
                            password: None,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.record.fps == 0 {
            return Err(anyhow!("record.fps must be greater than zero"));
        }
        if self.record.recorder.max_clip.is_zero() {
            return Err(anyhow!("record.max_clip_secs must be greater than zero"));
        }
        if self.detection.scheduler.cycle.is_zero() {
            return Err(anyhow!("detection.cycle_ms must be greater than zero"));
        }
        if self.detection.scheduler.detections_for_event == 0 {
            return Err(anyhow!("detection.detections_for_event must be greater than zero"));
        }
        if self.review.queue_capacity == 0 {
            return Err(anyhow!("review.queue_capacity must be greater than zero"));
        }

        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.id.0 == 0 {
                return Err(anyhow!("camera id 0 is reserved for the system"));
            }
            if !seen.insert(camera.id) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            if camera.shape.is_empty() {
                return Err(anyhow!("camera {}: frame dimensions must be non-zero", camera.id));
            }
            if camera.fps == 0 {
                return Err(anyhow!("camera {}: fps must be greater than zero", camera.id));
            }
            if !(camera.confidence > 0.0 && camera.confidence <= 1.0) {
                return Err(anyhow!(
                    "camera {}: confidence must be in (0, 1], got {}",
                    camera.id,
                    camera.confidence
                ));
            }
            if camera.source_uri.trim().is_empty() {
                return Err(anyhow!("camera {}: url is empty", camera.id));
            }
        }
        Ok(())
    }
}

fn camera_settings(file: CameraConfigFile, default_fps: u32) -> Result<CameraSettings> {
    let shape = FrameShape::new(file.height, file.width, file.channels.unwrap_or(3), PixelDepth::U8);
    let region = match file.region {
        Some(points) => RegionOfInterest::new(points)
            .with_context(|| format!("camera {}: invalid region", file.id))?,
        None => RegionOfInterest::full_frame(),
    };
    let mut settings = CameraSettings::new(file.id, file.url, shape);
    if let Some(name) = file.name.filter(|n| !n.trim().is_empty()) {
        settings.name = name;
    }
    settings.fps = file.fps.unwrap_or(default_fps);
    settings.detect = file.detect.unwrap_or(true);
    settings.record = file.record.unwrap_or(true);
    settings.class_filter = file.classes.unwrap_or_else(|| vec![0]);
    settings.confidence = file.confidence.unwrap_or(DEFAULT_CONFIDENCE);
    settings.region = region;
    settings.armed = file.armed.unwrap_or(true);
    Ok(settings)
}

fn read_config_file(path: &Path) -> Result<RingwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    parse_config(&raw, is_toml)
        .map_err(|e| anyhow!("invalid config file {}: {:#}", path.display(), e))
}

fn parse_config(raw: &str, is_toml: bool) -> Result<RingwatchConfigFile> {
    if is_toml {
        Ok(toml::from_str(raw)?)
    } else {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() -> Result<()> {
        let cfg = RingwatchConfig::from_text("{}", false)?;
        assert_eq!(cfg.db_path, PathBuf::from("data/ringwatch.db"));
        assert_eq!(cfg.record.fps, 30);
        assert_eq!(cfg.record.recorder.max_clip, Duration::from_secs(1800));
        assert_eq!(cfg.detection.scheduler.detections_for_event, 5);
        assert_eq!(cfg.detection.backend, "motion");
        assert_eq!(cfg.alarm.grace, Duration::from_secs(30));
        assert!(cfg.cameras.is_empty());
        Ok(())
    }

    #[test]
    fn toml_cameras_and_capacity() -> Result<()> {
        let cfg = RingwatchConfig::from_text(
            r#"
            [record]
            fps = 10
            pre_roll_secs = 3

            [[cameras]]
            id = 2
            name = "driveway"
            url = "stub://driveway"
            width = 640
            height = 480
            region = [[0.0, 0.5], [1.0, 0.5], [1.0, 1.0], [0.0, 1.0]]

            [[autoarm]]
            at = "22:00"
            action = "arm"
            "#,
            true,
        )?;
        let camera = &cfg.cameras[0];
        assert_eq!(camera.name, "driveway");
        assert_eq!(camera.shape, FrameShape::rgb8(640, 480));
        assert_eq!(camera.region.points().len(), 4);
        assert_eq!(cfg.buffer_capacity(camera), 30);
        assert_eq!(cfg.autoarm.len(), 1);
        Ok(())
    }

    #[test]
    fn rejects_reserved_and_duplicate_ids() {
        let camera = |id: u32| {
            format!(r#"{{"id": {id}, "url": "stub://x", "width": 4, "height": 4}}"#)
        };
        let zero = format!(r#"{{"cameras": [{}]}}"#, camera(0));
        assert!(RingwatchConfig::from_text(&zero, false).is_err());
        let dup = format!(r#"{{"cameras": [{}, {}]}}"#, camera(1), camera(1));
        assert!(RingwatchConfig::from_text(&dup, false).is_err());
        let bad_conf = r#"{"cameras": [{"id": 1, "url": "stub://x", "width": 4, "height": 4, "confidence": 1.5}]}"#;
        assert!(RingwatchConfig::from_text(bad_conf, false).is_err());
    }
}
