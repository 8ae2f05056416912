//! Wiring: turns a `RingwatchConfig` into supervised units.
//!
//! Unit names: `ingest-<id>` and `record-<id>` per camera, `detect`,
//! `review-decode`, `review-reassemble`, `notify`, `control` and, when
//! schedules exist, `autoarm`. Each factory builds a fresh task from
//! long-lived shared pieces (camera state, channels, backend), so a restart
//! only loses what the failed instance had in flight.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::autoarm::AutoArm;
use crate::camera::{CameraState, SharedState};
use crate::clock::{Clock, SystemClock};
use crate::config::RingwatchConfig;
use crate::detect::{BackendRegistry, DetectionCapability, SharedBackend};
use crate::ingest::{open_source, StreamIngestor};
use crate::media::MediaLayout;
use crate::notify::{
    AlarmEscalator, AlarmRelay, Command, CommandHandler, CommandWorker, LogRelay, LogSink,
    NotificationSink, NotificationWorker, Notice, SnapshotSink,
};
use crate::record::{codec_by_name, ClipCodec, ClipNotice, ClipRecorder};
use crate::review::{ReviewDecoder, ReviewQueues, ReviewReassembler};
use crate::scheduler::{DetectionScheduler, ReviewLink};
use crate::state_store::{SqliteStateStore, StateStore};
use crate::supervisor::{Supervisor, Task};

/// Everything `ringwatchd` needs to run and talk to the system.
pub struct Runtime {
    pub state: Arc<SharedState>,
    pub supervisor: Supervisor,
    /// Feed for operator commands (arm, disarm, cancel, snapshot).
    pub commands: Sender<Command>,
    pub notices: Sender<Notice>,
}

/// Builder knobs that are not part of the config file.
pub struct RuntimeOptions {
    pub clock: Arc<dyn Clock>,
    pub registry: BackendRegistry,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            registry: BackendRegistry::with_builtin(),
        }
    }
}

pub fn build(config: &RingwatchConfig) -> Result<Runtime> {
    build_with(config, RuntimeOptions::default())
}

pub fn build_with(config: &RingwatchConfig, options: RuntimeOptions) -> Result<Runtime> {
    check_features(config)?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let layout = MediaLayout::new(&config.data_dir);
    let clock = options.clock;

    let mut cameras = Vec::with_capacity(config.cameras.len());
    for settings in &config.cameras {
        let capacity = config.buffer_capacity(settings);
        let camera = CameraState::new(settings.clone(), capacity)
            .with_context(|| format!("camera {}: allocate ring buffer", settings.id))?;
        log::info!(
            "camera {} ({}): {} at {} fps, {} frame pre-roll",
            settings.id,
            settings.name,
            settings.shape,
            settings.fps,
            capacity
        );
        cameras.push(camera);
    }
    let state = Arc::new(SharedState::new(config.system_armed, cameras)?);

    let (notices_tx, notices_rx) = unbounded::<Notice>();
    let (commands_tx, commands_rx) = unbounded::<Command>();

    // Persisted armed flags win over the configured defaults.
    let store = SqliteStateStore::open(&config.db_path)?;
    CommandHandler::new(state.clone(), Box::new(store), notices_tx.clone()).restore()?;

    let backend = options.registry.require(&config.detection.backend)?;
    backend
        .lock()
        .map_err(|_| anyhow!("detector backend lock poisoned"))?
        .warm_up()
        .with_context(|| format!("warm up detector {}", config.detection.backend))?;
    if config.detection.scheduler.reverify
        && !options
            .registry
            .supports(&config.detection.backend, DetectionCapability::CropReverify)?
    {
        log::warn!(
            "detector {} cannot reverify crops; reverify is skipped",
            config.detection.backend
        );
    }
    let codec = codec_by_name(&config.record.codec)?;

    let mut supervisor = Supervisor::new(config.supervisor.clone()).with_notices(notices_tx.clone());

    let review = config
        .review
        .enabled
        .then(|| ReviewQueues::new(config.review.queue_capacity));
    // Without review, finished clips are simply not announced to anyone.
    let orders_tx = match &review {
        Some(queues) => queues.orders_tx(),
        None => unbounded::<ClipNotice>().0,
    };

    for camera in state.cameras() {
        add_ingestor(&mut supervisor, camera.clone(), config);
        if camera.settings().record {
            let camera = camera.clone();
            let layout = layout.clone();
            let codec = codec.clone();
            let clock = clock.clone();
            let orders_tx = orders_tx.clone();
            let settings = config.record.recorder.clone();
            supervisor.add_unit(format!("record-{}", camera.id()), true, move || {
                Ok(Box::new(ClipRecorder::new(
                    camera.clone(),
                    layout.clone(),
                    codec.clone(),
                    clock.clone(),
                    orders_tx.clone(),
                    settings.clone(),
                )) as Box<dyn Task>)
            });
        }
    }

    add_scheduler(
        &mut supervisor,
        state.clone(),
        backend,
        notices_tx.clone(),
        review.as_ref(),
        config,
    );
    if let Some(queues) = &review {
        add_review(&mut supervisor, queues, layout.clone(), codec, config.review.delete_raw);
    }
    add_notifier(
        &mut supervisor,
        notices_rx,
        commands_tx.clone(),
        layout,
        clock.clone(),
        config,
    );
    add_control(
        &mut supervisor,
        state.clone(),
        commands_rx,
        notices_tx.clone(),
        config,
    );
    if !config.autoarm.is_empty() {
        let schedules = config.autoarm.clone();
        let commands = commands_tx.clone();
        supervisor.add_unit("autoarm", true, move || {
            Ok(Box::new(AutoArm::new(schedules.clone(), commands.clone(), clock.clone())) as Box<dyn Task>)
        });
    }

    Ok(Runtime {
        state,
        supervisor,
        commands: commands_tx,
        notices: notices_tx,
    })
}

/// Fail early on settings this build cannot honour.
fn check_features(config: &RingwatchConfig) -> Result<()> {
    if cfg!(not(feature = "notify-mqtt")) {
        if let Some(mqtt) = &config.mqtt {
            return Err(anyhow!(
                "mqtt broker {} configured but this build lacks the notify-mqtt feature",
                mqtt.broker
            ));
        }
    }
    if cfg!(not(feature = "alarm-relay")) {
        if let Some(url) = &config.alarm.relay_url {
            return Err(anyhow!(
                "alarm relay {url} configured but this build lacks the alarm-relay feature"
            ));
        }
    }
    Ok(())
}

fn add_ingestor(supervisor: &mut Supervisor, camera: Arc<CameraState>, config: &RingwatchConfig) {
    let backoff = config.reconnect_backoff;
    supervisor.add_unit(format!("ingest-{}", camera.id()), true, move || {
        let source = open_source(camera.settings())?;
        Ok(Box::new(StreamIngestor::new(camera.clone(), source, backoff)) as Box<dyn Task>)
    });
}

fn add_scheduler(
    supervisor: &mut Supervisor,
    state: Arc<SharedState>,
    backend: SharedBackend,
    notices: Sender<Notice>,
    review: Option<&ReviewQueues>,
    config: &RingwatchConfig,
) {
    let link = review.map(|queues| ReviewLink {
        to_infer: queues.to_infer_rx(),
        from_infer: queues.from_infer_tx(),
        capacity: queues.capacity(),
    });
    let settings = config.detection.scheduler.clone();
    supervisor.add_unit("detect", true, move || {
        let mut scheduler =
            DetectionScheduler::new(state.clone(), backend.clone(), notices.clone(), settings.clone())?;
        if let Some(link) = &link {
            scheduler = scheduler.with_review(link.clone());
        }
        Ok(Box::new(scheduler) as Box<dyn Task>)
    });
}

fn add_review(
    supervisor: &mut Supervisor,
    queues: &ReviewQueues,
    layout: MediaLayout,
    codec: Arc<dyn ClipCodec>,
    delete_raw: bool,
) {
    {
        let queues = queues.clone();
        let codec = codec.clone();
        supervisor.add_unit("review-decode", true, move || {
            Ok(Box::new(ReviewDecoder::new(
                queues.orders_rx(),
                queues.orders_tx(),
                queues.to_infer_tx(),
                codec.clone(),
            )) as Box<dyn Task>)
        });
    }
    let queues = queues.clone();
    supervisor.add_unit("review-reassemble", true, move || {
        Ok(Box::new(ReviewReassembler::new(
            queues.from_infer_rx(),
            queues.orders_tx(),
            layout.clone(),
            codec.clone(),
            delete_raw,
        )) as Box<dyn Task>)
    });
}

fn add_notifier(
    supervisor: &mut Supervisor,
    notices: Receiver<Notice>,
    commands: Sender<Command>,
    layout: MediaLayout,
    clock: Arc<dyn Clock>,
    config: &RingwatchConfig,
) {
    let mqtt = config.mqtt.clone();
    supervisor.add_unit("notify", true, move || {
        let mut sinks: Vec<Box<dyn NotificationSink>> = vec![
            Box::new(LogSink),
            Box::new(SnapshotSink::new(layout.clone(), clock.clone())),
        ];
        if let Some(mqtt) = &mqtt {
            sinks.push(mqtt_sink(mqtt, commands.clone())?);
        }
        Ok(Box::new(NotificationWorker::new(notices.clone(), sinks)) as Box<dyn Task>)
    });
}

#[cfg(feature = "notify-mqtt")]
fn mqtt_sink(config: &crate::config::MqttConfig, commands: Sender<Command>) -> Result<Box<dyn NotificationSink>> {
    let mut settings =
        crate::notify::MqttSettings::from_broker(&config.broker, &config.client_id, &config.topic_prefix)?;
    settings.username = config.username.clone();
    settings.password = config.password.clone();
    Ok(Box::new(crate::notify::MqttSink::connect(&settings, commands)?))
}

#[cfg(not(feature = "notify-mqtt"))]
fn mqtt_sink(config: &crate::config::MqttConfig, _commands: Sender<Command>) -> Result<Box<dyn NotificationSink>> {
    Err(anyhow!("notify-mqtt feature missing for broker {}", config.broker))
}

fn add_control(
    supervisor: &mut Supervisor,
    state: Arc<SharedState>,
    commands: Receiver<Command>,
    notices: Sender<Notice>,
    config: &RingwatchConfig,
) {
    let db_path = config.db_path.clone();
    let relay_url = config.alarm.relay_url.clone();
    let grace = config.alarm.grace;
    supervisor.add_unit("control", true, move || {
        let store: Box<dyn StateStore> = Box::new(SqliteStateStore::open(&db_path)?);
        let handler = CommandHandler::new(state.clone(), store, notices.clone());
        let escalator = AlarmEscalator::new(state.clone(), notices.clone(), relay(relay_url.as_deref())?, grace);
        Ok(Box::new(CommandWorker::new(commands.clone(), handler, escalator)) as Box<dyn Task>)
    });
}

#[cfg(feature = "alarm-relay")]
fn relay(url: Option<&str>) -> Result<Box<dyn AlarmRelay>> {
    Ok(match url {
        Some(url) => Box::new(crate::notify::HttpRelay::new(url)),
        None => Box::new(LogRelay),
    })
}

#[cfg(not(feature = "alarm-relay"))]
fn relay(url: Option<&str>) -> Result<Box<dyn AlarmRelay>> {
    match url {
        Some(url) => Err(anyhow!("alarm-relay feature missing for relay {url}")),
        None => Ok(Box::new(LogRelay)),
    }
}
