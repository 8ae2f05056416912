use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use ringwatch::config::RingwatchConfig;
use ringwatch::CameraId;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RINGWATCH_DATA_DIR",
        "RINGWATCH_DB_PATH",
        "RINGWATCH_CYCLE_MS",
        "RINGWATCH_DETECTOR",
        "RINGWATCH_MQTT_BROKER",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "data_dir": "/var/lib/ringwatch",
        "system_armed": false,
        "record": { "fps": 15, "pre_roll_secs": 4, "max_clip_secs": 600 },
        "detection": { "cycle_ms": 500, "detections_for_event": 3, "backend": "stub" },
        "review": { "enabled": false },
        "alarm": { "grace_secs": 10 },
        "cameras": [
            { "id": 1, "name": "porch", "url": "rtsp://porch/stream", "width": 1280, "height": 720 },
            { "id": 7, "url": "stub://garage", "width": 320, "height": 240, "channels": 1,
              "fps": 5, "armed": false, "classes": [0, 2], "confidence": 0.6 }
        ]
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    let cfg = RingwatchConfig::load(Some(file.path())).expect("load config");
    assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/ringwatch"));
    assert_eq!(cfg.db_path, PathBuf::from("/var/lib/ringwatch/ringwatch.db"));
    assert!(!cfg.system_armed);
    assert_eq!(cfg.record.recorder.max_clip, Duration::from_secs(600));
    assert_eq!(cfg.detection.scheduler.cycle, Duration::from_millis(500));
    assert_eq!(cfg.detection.scheduler.detections_for_event, 3);
    assert_eq!(cfg.detection.backend, "stub");
    assert!(!cfg.review.enabled);
    assert_eq!(cfg.alarm.grace, Duration::from_secs(10));

    let porch = &cfg.cameras[0];
    assert_eq!(porch.name, "porch");
    assert_eq!(porch.fps, 15);
    assert_eq!(cfg.buffer_capacity(porch), 60);
    let garage = &cfg.cameras[1];
    assert_eq!(garage.id, CameraId(7));
    assert_eq!(garage.shape.channels, 1);
    assert!(!garage.armed);
    assert_eq!(garage.class_filter, vec![0, 2]);
    assert_eq!(cfg.buffer_capacity(garage), 20);

    std::env::set_var("RINGWATCH_DATA_DIR", "/srv/rw");
    std::env::set_var("RINGWATCH_CYCLE_MS", "250");
    std::env::set_var("RINGWATCH_DETECTOR", "motion");
    std::env::set_var("RINGWATCH_MQTT_BROKER", "broker.lan:1883");
    let cfg = RingwatchConfig::load(Some(file.path())).expect("load config with env");
    assert_eq!(cfg.data_dir, PathBuf::from("/srv/rw"));
    assert_eq!(cfg.db_path, PathBuf::from("/srv/rw/ringwatch.db"));
    assert_eq!(cfg.detection.scheduler.cycle, Duration::from_millis(250));
    assert_eq!(cfg.detection.backend, "motion");
    let mqtt = cfg.mqtt.expect("mqtt from env");
    assert_eq!(mqtt.broker, "broker.lan:1883");
    assert_eq!(mqtt.topic_prefix, "ringwatch");

    std::env::set_var("RINGWATCH_DB_PATH", "/tmp/other.db");
    let cfg = RingwatchConfig::load(Some(file.path())).expect("load config with db env");
    assert_eq!(cfg.db_path, PathBuf::from("/tmp/other.db"));

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp toml config");
    let toml = r#"
        [detection]
        reverify = false

        [mqtt]
        broker = "127.0.0.1"
        topic_prefix = "home/cams"

        [[cameras]]
        id = 3
        url = "stub://yard"
        width = 64
        height = 48

        [[autoarm]]
        at = "07:30"
        action = "disarm"
        days = ["mon", "tue", "wed", "thu", "fri"]
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = RingwatchConfig::load(Some(file.path())).expect("load toml config");
    assert!(!cfg.detection.scheduler.reverify);
    assert_eq!(cfg.mqtt.as_ref().map(|m| m.topic_prefix.as_str()), Some("home/cams"));
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.autoarm[0].days.len(), 5);
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for bad in [
        r#"{"record": {"fps": 0}}"#,
        r#"{"detection": {"cycle_ms": 0}}"#,
        r#"{"detection": {"detections_for_event": 0}}"#,
        r#"{"review": {"queue_capacity": 0}}"#,
        r#"{"mqtt": {"client_id": "x"}}"#,
        r#"{"cameras": [{"id": 1, "url": "", "width": 4, "height": 4}]}"#,
        r#"{"cameras": [{"id": 1, "url": "stub://a", "width": 0, "height": 4}]}"#,
        r#"{"cameras": [{"id": 1, "url": "stub://a", "width": 4, "height": 4, "region": [[0.0, 0.0], [1.0, 1.0]]}]}"#,
        r#"{"autoarm": [{"at": "7am", "action": "arm"}]}"#,
    ] {
        assert!(
            RingwatchConfig::from_text(bad, false).is_err(),
            "accepted invalid config {bad}"
        );
    }

    std::env::set_var("RINGWATCH_CYCLE_MS", "fast");
    assert!(RingwatchConfig::load(None).is_err());
    clear_env();
}
