//! MQTT publishing of notices and subscription for remote commands.
//!
//! Topics, under a configurable prefix:
//! - `<prefix>/status`: `online`/`offline` (retained, last will)
//! - `<prefix>/<camera>/alarm`: `ON`/`OFF` (retained)
//! - `<prefix>/<camera|system>/armed`: `ON`/`OFF` (retained)
//! - `<prefix>/<camera|system>/event`: JSON summary of every notice
//! - `<prefix>/<camera|system>/set`: inbound `ARM`, `DISARM`, `CANCEL`,
//!   `CONFIRM`, `SNAPSHOT`

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use serde::Serialize;

use super::{ArmTarget, Command, NotificationSink, Notice};
use crate::camera::CameraId;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const SYSTEM_SEGMENT: &str = "system";

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    /// `host:port`, port defaulting to 1883.
    pub fn from_broker(broker: &str, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let (host, port) = match broker.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| anyhow!("invalid mqtt broker port in {broker:?}"))?,
            ),
            None => (broker.to_string(), 1883),
        };
        if host.is_empty() {
            return Err(anyhow!("mqtt broker host is empty"));
        }
        Ok(Self {
            host,
            port,
            client_id: client_id.to_string(),
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            username: None,
            password: None,
        })
    }
}

#[derive(Serialize)]
struct EventPayload<'a> {
    kind: &'a str,
    camera: Option<u32>,
    summary: String,
    timestamp: i64,
}

pub struct MqttSink {
    client: Client,
    prefix: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    /// Connect and subscribe. Inbound commands go to `commands`.
    pub fn connect(settings: &MqttSettings, commands: Sender<Command>) -> Result<Self> {
        let prefix = settings.topic_prefix.clone();
        let status_topic = format!("{prefix}/status");

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &status_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));

        let (client, connection) = Client::new(options, 10);
        client.subscribe(format!("{prefix}/+/set"), QoS::AtLeastOnce)?;
        client.publish(status_topic, QoS::AtLeastOnce, true, PAYLOAD_ONLINE.as_bytes().to_vec())?;
        let handle = spawn_event_loop(connection, prefix.clone(), commands)?;
        log::info!(
            "notify: mqtt connected to {}:{} (auth: {})",
            settings.host,
            settings.port,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            prefix,
            connection_handle: Some(handle),
        })
    }

    /// Never blocks: a full request queue (broker gone) is a delivery error.
    fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client.try_publish(topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }

    fn segment(camera: Option<CameraId>) -> String {
        camera.map_or_else(|| SYSTEM_SEGMENT.to_string(), |id| id.to_string())
    }
}

impl NotificationSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn deliver(&mut self, notice: &Notice) -> Result<()> {
        let segment = Self::segment(notice.camera());
        match notice {
            Notice::AlarmRaised { .. } | Notice::AlarmCleared { .. } => {
                let on = matches!(notice, Notice::AlarmRaised { .. });
                self.publish(
                    format!("{}/{segment}/alarm", self.prefix),
                    on_off(on),
                    true,
                )?;
            }
            Notice::ArmedChanged { armed, .. } => {
                self.publish(
                    format!("{}/{segment}/armed", self.prefix),
                    on_off(*armed),
                    true,
                )?;
            }
            _ => {}
        }
        let payload = EventPayload {
            kind: kind_label(notice),
            camera: notice.camera().map(|id| id.0),
            summary: notice.summary(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.publish(
            format!("{}/{segment}/event", self.prefix),
            serde_json::to_vec(&payload)?,
            false,
        )
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        let _ = self.client.try_publish(
            format!("{}/status", self.prefix),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
        );
        let _ = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_event_loop(
    mut connection: Connection,
    prefix: String,
    commands: Sender<Command>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("mqtt-events".into())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic);
                        let payload = String::from_utf8_lossy(&publish.payload);
                        match parse_command(&prefix, &topic, &payload) {
                            Some(command) => {
                                log::info!("notify: mqtt command {command} from {topic}");
                                if commands.send(command).is_err() {
                                    break;
                                }
                            }
                            None => log::warn!("notify: ignoring mqtt message on {topic}: {payload:?}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

fn on_off(on: bool) -> Vec<u8> {
    if on { b"ON".to_vec() } else { b"OFF".to_vec() }
}

fn kind_label(notice: &Notice) -> &'static str {
    match notice {
        Notice::Snapshot { .. } => "snapshot",
        Notice::AlarmRaised { .. } => "alarm_raised",
        Notice::AlarmCleared { .. } => "alarm_cleared",
        Notice::AlarmPending { .. } => "alarm_pending",
        Notice::AlarmTriggered => "alarm_triggered",
        Notice::AlarmCancelled => "alarm_cancelled",
        Notice::RelayFailed { .. } => "relay_failed",
        Notice::ArmedChanged { .. } => "armed_changed",
        Notice::UnitFailed { .. } => "unit_failed",
    }
}

/// Map `<prefix>/<segment>/set` plus payload to a command.
pub(crate) fn parse_command(prefix: &str, topic: &str, payload: &str) -> Option<Command> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let segment = rest.strip_suffix("/set")?;
    let target = match segment {
        SYSTEM_SEGMENT => ArmTarget::System,
        "all" => ArmTarget::All,
        id => ArmTarget::Camera(CameraId(id.parse().ok()?)),
    };
    match (payload.trim().to_ascii_uppercase().as_str(), target) {
        ("ARM", target) => Some(Command::Arm(target)),
        ("DISARM", target) => Some(Command::Disarm(target)),
        ("CANCEL", _) => Some(Command::CancelAlarm),
        ("CONFIRM", _) => Some(Command::ConfirmAlarm),
        ("SNAPSHOT", ArmTarget::Camera(id)) => Some(Command::Snapshot(id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_topics() {
        assert_eq!(
            parse_command("rw", "rw/system/set", "arm"),
            Some(Command::Arm(ArmTarget::System))
        );
        assert_eq!(
            parse_command("rw", "rw/3/set", " DISARM "),
            Some(Command::Disarm(ArmTarget::Camera(CameraId(3))))
        );
        assert_eq!(
            parse_command("rw", "rw/3/set", "SNAPSHOT"),
            Some(Command::Snapshot(CameraId(3)))
        );
        assert_eq!(parse_command("rw", "rw/system/set", "SNAPSHOT"), None);
        assert_eq!(parse_command("rw", "other/3/set", "ARM"), None);
        assert_eq!(parse_command("rw", "rw/x/set", "ARM"), None);
    }

    #[test]
    fn broker_address_parsing() -> Result<()> {
        let settings = MqttSettings::from_broker("10.0.0.2:1884", "rw", "ringwatch/")?;
        assert_eq!((settings.host.as_str(), settings.port), ("10.0.0.2", 1884));
        assert_eq!(settings.topic_prefix, "ringwatch");
        assert_eq!(MqttSettings::from_broker("broker", "rw", "rw")?.port, 1883);
        assert!(MqttSettings::from_broker(":1883", "rw", "rw").is_err());
        Ok(())
    }
}
