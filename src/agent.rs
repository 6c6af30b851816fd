use crate::config::{self, DeviceConfig, PUBSUB_SITE};
use crate::connection::ConnectionManager;
use crate::gate::StartupGate;
use crate::messages::{
    Config, Entry, GatewayError, Metadata, PointsetEvent, State, SystemEvent, LEVEL_ERROR,
    LEVEL_INFO,
};
use crate::points::{self, Point};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::state::StateStore;
use crate::swarm::{self, BootstrapQueue};
use crate::transport::{
    MqttTransport, Transport, TransportError, TransportEvent, TransportFactory,
};
use chrono::Utc;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub const TOPIC_CONFIG: &str = "config";
pub const TOPIC_ERRORS: &str = "errors";
pub const TOPIC_STATE: &str = "state";
pub const TOPIC_POINTSET_EVENT: &str = "events/pointset";
pub const TOPIC_SYSTEM_EVENT: &str = "events/system";

/// How long a freshly connected device waits for its first config.
pub const CONFIG_WAIT_TIME: Duration = Duration::from_secs(10);

const STATE_THROTTLE_MS: u64 = 2000;
const LOGGING_MOD_COUNT: u32 = 10;
const CONFIG_ERROR_STATUS_KEY: &str = "config_error";
const MAKE_MODEL: &str = "fieldpub_sim";
const FIRMWARE_VERSION: &str = "v1";
const LOG_CATEGORY: &str = "fieldpub";

#[derive(Debug, Error)]
pub enum PubberError {
    #[error("Config message error: {0}")]
    Config(String),
    #[error("Connection error: {0}")]
    Connection(#[from] TransportError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid device setup: {0}")]
    Configuration(String),
    #[error("Message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Startup config handshake timed out")]
    Handshake,
}

impl PubberError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "device.config",
            Self::Connection(_) => "device.connection",
            Self::Io { .. } => "device.io",
            Self::Configuration(_) => "device.setup",
            Self::Encoding(_) => "device.encoding",
            Self::Handshake => "device.start",
        }
    }

    /// Render the error with its full cause chain.
    pub fn detail(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str("; caused by: ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Connection(TransportError::ConnectionClosed))
    }
}

/// Everything a tick or config application mutates, behind one lock so
/// handlers and the report loop serialize.
struct AgentCore {
    store: StateStore,
    points: Vec<Point>,
    events: PointsetEvent,
    scheduler: Scheduler,
    last_state_publish: Option<tokio::time::Instant>,
    send_count: u32,
}

pub struct PubberOptions {
    pub config: DeviceConfig,
    pub transport_factory: Option<TransportFactory>,
    pub queue: Option<Arc<dyn BootstrapQueue>>,
}

impl PubberOptions {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            transport_factory: None,
            queue: None,
        }
    }
}

/// A single simulated device instance.
pub struct Pubber {
    weak: Weak<Pubber>,
    device_id: String,
    config: DeviceConfig,
    connection: ConnectionManager,
    core: Mutex<AgentCore>,
    gate: StartupGate,
    done: StdMutex<Option<mpsc::UnboundedSender<()>>>,
    terminated: AtomicBool,
}

impl Pubber {
    /// Resolve device identity and point metadata, build the simulated
    /// points, and wire up the connection. The device is not connected
    /// until `start_connection` runs.
    pub async fn initialize(options: PubberOptions) -> Result<Arc<Self>, PubberError> {
        let PubberOptions {
            mut config,
            transport_factory,
            queue,
        } = options;

        let metadata = Self::resolve_metadata(&mut config, queue).await?;

        let device_id = config
            .device_id
            .clone()
            .ok_or_else(|| PubberError::Configuration("device id not specified".to_string()))?;

        info!(
            "Starting device {}, serial {}, mac {}, extra {}, gateway {}",
            device_id,
            config.serial_no.as_deref().unwrap_or("unknown"),
            config.mac_addr.as_deref().unwrap_or("unknown"),
            config.extra_field.as_deref().unwrap_or("-"),
            config.gateway_id.as_deref().unwrap_or("-"),
        );

        // Site-model launches keep their auth keys next to the device
        // metadata; rewrite the key path to match the resolved algorithm.
        if let Some(site_path) = config.site_path.clone().as_deref() {
            if site_path != PUBSUB_SITE && config.key_file.is_some() {
                config.key_file = Some(config::site_key_file(
                    site_path,
                    &device_id,
                    &config.algorithm,
                ));
            }
        }
        config.load_key_bytes()?;

        fs::create_dir_all(&config.out_dir).map_err(|source| PubberError::Io {
            context: format!("creating artifact directory {}", config.out_dir.display()),
            source,
        })?;

        let mut store = StateStore::new();
        store.init_system(config.serial_no.clone(), MAKE_MODEL, FIRMWARE_VERSION);

        let mut events = PointsetEvent::new();
        events.extra_field = config.extra_field.clone();

        let device_points = Self::build_points(metadata.as_ref(), &mut store, &mut events)?;
        store.clear_dirty();

        let transport: Arc<dyn Transport> = match &transport_factory {
            Some(factory) => factory(&config),
            None => Arc::new(MqttTransport::from_config(&config)),
        };
        let connection = ConnectionManager::new(transport, config.out_dir.clone());

        let pubber = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            device_id,
            config,
            connection,
            core: Mutex::new(AgentCore {
                store,
                points: device_points,
                events,
                scheduler: Scheduler::new(),
                last_state_publish: None,
                send_count: 0,
            }),
            gate: StartupGate::new(),
            done: StdMutex::new(None),
            terminated: AtomicBool::new(false),
        });

        pubber.register_handlers();
        pubber.spawn_dispatch();

        Ok(pubber)
    }

    /// Resolve device identity from the bootstrap feed or the site model,
    /// returning whatever device metadata the source carries.
    async fn resolve_metadata(
        config: &mut DeviceConfig,
        queue: Option<Arc<dyn BootstrapQueue>>,
    ) -> Result<Option<Metadata>, PubberError> {
        let metadata = match config.site_path.clone().as_deref() {
            Some(PUBSUB_SITE) => {
                let queue = queue.ok_or_else(|| {
                    PubberError::Configuration(
                        "swarm launch requires a bootstrap queue".to_string(),
                    )
                })?;
                swarm::pull_bootstrap(queue.as_ref(), config).await?
            }
            Some(site_path) => {
                let registry = config::load_registry_config(site_path)?;
                config.registry_id = registry.registry_id;
                config.cloud_region = registry.cloud_region;
                let device_id = config.device_id.clone().ok_or_else(|| {
                    PubberError::Configuration(
                        "device id required for site model launch".to_string(),
                    )
                })?;
                Some(config::load_device_metadata(site_path, &device_id)?)
            }
            None => None,
        };

        if let Some(auth_type) = metadata
            .as_ref()
            .and_then(|m| m.cloud.as_ref())
            .and_then(|cloud| cloud.auth_type.clone())
        {
            config.algorithm = auth_type;
        }
        Ok(metadata)
    }

    /// Build the simulated points the metadata names, seeding the state
    /// store and the reusable pointset event document.
    fn build_points(
        metadata: Option<&Metadata>,
        store: &mut StateStore,
        events: &mut PointsetEvent,
    ) -> Result<Vec<Point>, PubberError> {
        let mut device_points: Vec<Point> = Vec::new();
        let Some(metadata) = metadata else {
            return Ok(device_points);
        };
        let models = metadata
            .pointset
            .as_ref()
            .map_or_else(points::default_points, |pointset| pointset.points.clone());
        for (name, model) in &models {
            let point = Point::from_metadata(name, model)?;
            if device_points.iter().any(|p| p.name() == point.name()) {
                return Err(PubberError::Configuration(format!(
                    "point {name} already registered"
                )));
            }
            store.upsert_point(point.name(), point.state_fragment());
            events
                .points
                .insert(point.name().to_string(), point.event_fragment());
            device_points.push(point);
        }
        Ok(device_points)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.gate.is_released()
    }

    pub async fn scheduler_stats(&self) -> SchedulerStats {
        self.core.lock().await.scheduler.stats()
    }

    pub async fn active_interval_ms(&self) -> u64 {
        self.core.lock().await.scheduler.period_ms()
    }

    pub async fn state_snapshot(&self) -> State {
        self.core.lock().await.store.state().clone()
    }

    fn register_handlers(&self) {
        if let Some(gateway_id) = &self.config.gateway_id {
            self.connection.register_handler(
                gateway_id,
                TOPIC_CONFIG,
                |config: Option<Config>| async move {
                    info!(
                        "Gateway config received, timestamp {:?}",
                        config.and_then(|c| c.timestamp)
                    );
                    Ok(())
                },
            );
            self.connection.register_handler(
                gateway_id,
                TOPIC_ERRORS,
                |report: Option<GatewayError>| async move {
                    warn!("Gateway error report: {:?}", report);
                    Ok(())
                },
            );
        }

        let weak = self.weak.clone();
        self.connection.register_handler(
            &self.device_id,
            TOPIC_CONFIG,
            move |config: Option<Config>| {
                let weak = weak.clone();
                async move {
                    if let Some(pubber) = weak.upgrade() {
                        pubber.handle_config(config).await;
                    }
                    Ok(())
                }
            },
        );
    }

    fn spawn_dispatch(&self) {
        let Some(mut events) = self.connection.take_events() else {
            warn!("Transport event stream already claimed");
            return;
        };
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(pubber) = weak.upgrade() else { break };
                match event {
                    TransportEvent::Message {
                        device_id,
                        topic,
                        payload,
                    } => {
                        if let Err(err) =
                            pubber.connection.dispatch(&device_id, &topic, payload).await
                        {
                            error!("Inbound {} message failed: {}", topic, err);
                            pubber.report_error(Some(&err)).await;
                        }
                    }
                    TransportEvent::Fault(fault) => {
                        error!("Transport fault: {}", fault);
                        let err = PubberError::Connection(fault);
                        pubber.report_error(Some(&err)).await;
                    }
                }
            }
        });
    }

    /// Connect and wait for the startup config handshake. Returns whether
    /// the first config arrived before the deadline.
    pub async fn start_connection(&self, done_tx: mpsc::UnboundedSender<()>) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = Some(done_tx);

        if let Err(err) = self.connection.connect().await {
            // The handshake timeout below surfaces the failure.
            error!("Connection attempt failed: {}", err);
        }

        let released = self.gate.wait(CONFIG_WAIT_TIME).await;
        info!("Synchronized start config result {}", released);
        if !released {
            if let Err(err) = self.connection.close().await {
                error!("Close after startup timeout failed: {}", err);
            }
        }
        released
    }

    /// Apply one inbound config document. Failures degrade into a status
    /// entry and an error log; they never take the instance down.
    async fn handle_config(&self, config: Option<Config>) {
        match self.apply_config(config).await {
            Ok(()) => self.report_error(None).await,
            Err(err) => {
                error!("Config application failed: {}", err);
                self.report_error(Some(&err)).await;
            }
        }
    }

    async fn apply_config(&self, config: Option<Config>) -> Result<(), PubberError> {
        // Mirror the document exactly as delivered, literal null included.
        let raw = serde_json::to_vec(&config)?;
        self.connection.write_capture(TOPIC_CONFIG, &raw)?;

        let mut core = self.core.lock().await;
        let interval_ms = match &config {
            Some(config) => {
                info!("Updating config with timestamp {:?}", config.timestamp);
                core.store.set_last_config(config.timestamp);

                let pointset = config.pointset.as_ref();
                {
                    let AgentCore { points, .. } = &mut *core;
                    for point in points.iter_mut() {
                        let point_config = pointset.and_then(|p| p.points.get(point.name()));
                        point.apply_config(point_config)?;
                    }
                }
                core.store
                    .set_state_etag(pointset.and_then(|p| p.state_etag.clone()));
                config::effective_interval_ms(pointset)
            }
            None => {
                info!("Defaulting empty config");
                config::effective_interval_ms(None)
            }
        };
        Self::fold_dirty_points(&mut core);

        let weak = self.weak.clone();
        let restarted = core.scheduler.maybe_restart(interval_ms, move |period| {
            tokio::spawn(Self::report_loop(weak, period))
        });
        if restarted {
            info!("Starting executor with send message delay {}ms", interval_ms);
        }

        self.gate.release();
        self.publish_state_locked(&mut core).await?;
        Ok(())
    }

    async fn report_loop(weak: Weak<Self>, period: Duration) {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(pubber) = weak.upgrade() else { break };
            if !pubber.run_tick().await {
                break;
            }
        }
    }

    async fn run_tick(&self) -> bool {
        if let Err(err) = self.send_messages().await {
            error!("Report cycle failed, terminating: {}", err);
            // terminate() aborts this very task; run it detached so the
            // connection still closes.
            if let Some(pubber) = self.weak.upgrade() {
                tokio::spawn(async move { pubber.terminate().await });
            }
            return false;
        }
        true
    }

    async fn send_messages(&self) -> Result<(), PubberError> {
        let mut core = self.core.lock().await;
        Self::update_points(&mut core);
        self.send_device_points(&core).await?;
        if core.send_count % LOGGING_MOD_COUNT == 0 {
            let message = format!("Sent {} messages", core.send_count);
            self.send_system_log(&message).await?;
        }
        if core.store.is_dirty() {
            self.publish_state_locked(&mut core).await?;
        }
        core.send_count = core.send_count.wrapping_add(1);
        Ok(())
    }

    fn update_points(core: &mut AgentCore) {
        for point in &mut core.points {
            point.tick();
        }
        Self::fold_dirty_points(core);
    }

    fn fold_dirty_points(core: &mut AgentCore) {
        let AgentCore {
            store,
            points,
            events,
            ..
        } = core;
        for point in points.iter_mut() {
            events
                .points
                .insert(point.name().to_string(), point.event_fragment());
            if point.take_dirty() {
                store.upsert_point(point.name(), point.state_fragment());
            }
        }
    }

    async fn send_device_points(&self, core: &AgentCore) -> Result<(), PubberError> {
        let mut event = core.events.clone();
        event.timestamp = Utc::now();
        if self.config.verbose {
            info!("Sending pointset event with {} points", event.points.len());
        }
        self.connection
            .publish(&self.device_id, TOPIC_POINTSET_EVENT, &event)
            .await
    }

    async fn send_system_log(&self, message: &str) -> Result<(), PubberError> {
        let event = SystemEvent::new(vec![Entry::new(LEVEL_INFO, LOG_CATEGORY, message)]);
        self.connection
            .publish(&self.device_id, TOPIC_SYSTEM_EVENT, &event)
            .await
    }

    /// Publish the state document, pacing publishes at least the throttle
    /// interval apart. Sleeping with the core lock held serializes every
    /// publisher through the same throttle.
    async fn publish_state_locked(&self, core: &mut AgentCore) -> Result<(), PubberError> {
        if let Some(last) = core.last_state_publish {
            tokio::time::sleep_until(last + Duration::from_millis(STATE_THROTTLE_MS)).await;
        }
        core.last_state_publish = Some(tokio::time::Instant::now());
        core.store.clear_dirty();
        let state = core.store.stamped_snapshot();
        if self.config.verbose {
            info!(
                "Update state {:?} last_config {:?}",
                state.timestamp, state.system.last_config
            );
        }
        self.connection
            .publish(&self.device_id, TOPIC_STATE, &state)
            .await
    }

    /// Surface a device error (or clear the previous one) through the
    /// state document. Never propagates.
    pub async fn report_error(&self, error: Option<&PubberError>) {
        match error {
            Some(error) => {
                error!("Reporting device error: {}", error);
                let entry = Self::error_entry(error);
                {
                    let mut core = self.core.lock().await;
                    core.store.set_status(CONFIG_ERROR_STATUS_KEY, Some(entry));
                    if let Err(publish_err) = self.publish_state_locked(&mut core).await {
                        error!("State publish for error report failed: {}", publish_err);
                    }
                }
                if !self.gate.is_released() {
                    warn!("Releasing startup gate after error");
                    self.gate.release();
                }
                if error.is_connection_closed() {
                    self.signal_done();
                }
            }
            None => {
                let mut core = self.core.lock().await;
                if core.store.set_status(CONFIG_ERROR_STATUS_KEY, None) {
                    if let Err(publish_err) = self.publish_state_locked(&mut core).await {
                        error!("State publish for error clear failed: {}", publish_err);
                    }
                }
            }
        }
    }

    fn error_entry(error: &PubberError) -> Entry {
        let mut entry = Entry::new(LEVEL_ERROR, error.category(), &error.to_string());
        entry.detail = Some(error.detail());
        entry
    }

    fn signal_done(&self) {
        let sender = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Stop the report loop and close the connection. Safe to call more
    /// than once.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Terminating device {}", self.device_id);
        {
            let mut core = self.core.lock().await;
            core.scheduler.cancel();
        }
        if let Err(err) = self.connection.close().await {
            error!("Connection close failed: {}", err);
        }
    }
}
