use crate::agent::{Pubber, PubberError, PubberOptions};
use crate::config::DeviceConfig;
use crate::messages::{Metadata, SwarmMessage};
use crate::transport::{TransportError, TransportFactory};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const SWARM_SUBFOLDER: &str = "swarm";

const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);
const FEED_KEEP_ALIVE: Duration = Duration::from_secs(30);
const FEED_CAPACITY: usize = 32;

/// One message consumed from the bootstrap feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Shared feed of bootstrap bundles; each pull consumes one message.
/// Implementations retry transient faults internally, so an error from
/// `pull` is terminal.
#[async_trait]
pub trait BootstrapQueue: Send + Sync {
    async fn pull(&self) -> Result<Bundle, PubberError>;
}

/// Pull bundles until one describes a swarm device, then load it into
/// the device settings. Returns the bundled device metadata.
pub async fn pull_bootstrap(
    queue: &dyn BootstrapQueue,
    config: &mut DeviceConfig,
) -> Result<Option<Metadata>, PubberError> {
    loop {
        let bundle = queue.pull().await?;
        let sub_folder = bundle.attributes.get("subFolder").map(String::as_str);
        if sub_folder != Some(SWARM_SUBFOLDER) {
            warn!("Ignoring bundle with subFolder {:?}", sub_folder);
            continue;
        }
        match apply_bundle(&bundle, config) {
            Ok(metadata) => return Ok(metadata),
            Err(err) => {
                error!("Invalid bootstrap bundle: {}", err);
                tokio::time::sleep(PULL_RETRY_DELAY).await;
            }
        }
    }
}

fn apply_bundle(
    bundle: &Bundle,
    config: &mut DeviceConfig,
) -> Result<Option<Metadata>, PubberError> {
    let device_id = required_attribute(bundle, "deviceId")?;
    let registry_id = required_attribute(bundle, "deviceRegistryId")?;
    let region = required_attribute(bundle, "deviceRegistryLocation")?;

    let message: SwarmMessage = serde_json::from_value(bundle.body.clone())
        .map_err(|err| PubberError::Config(format!("parsing swarm message: {err}")))?;
    let key_bytes = STANDARD
        .decode(&message.key_base64)
        .map_err(|err| PubberError::Config(format!("decoding device key: {err}")))?;

    info!("Configured swarm device {device_id} in registry {registry_id}");
    config.device_id = Some(device_id);
    config.registry_id = Some(registry_id);
    config.cloud_region = Some(region);
    config.key_bytes = Some(key_bytes);
    Ok(message.device_metadata)
}

fn required_attribute(bundle: &Bundle, key: &str) -> Result<String, PubberError> {
    bundle
        .attributes
        .get(key)
        .cloned()
        .ok_or_else(|| PubberError::Configuration(format!("bundle missing {key} attribute")))
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub backoff: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwarmOptions {
    pub project_id: String,
    pub instance_count: u32,
    pub restart_policy: RestartPolicy,
}

/// Boots N device instances off the bootstrap feed and keeps each one
/// alive with a restart loop.
pub struct SwarmSupervisor {
    options: SwarmOptions,
    queue: Arc<dyn BootstrapQueue>,
    transport_factory: Option<TransportFactory>,
}

impl SwarmSupervisor {
    pub fn new(options: SwarmOptions, queue: Arc<dyn BootstrapQueue>) -> Self {
        Self {
            options,
            queue,
            transport_factory: None,
        }
    }

    #[must_use]
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Launch every instance task. Instance n runs with serial
    /// `<hostname>-n`, counted from 1.
    pub fn spawn_instances(&self) -> Vec<JoinHandle<()>> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        (1..=self.options.instance_count)
            .map(|n| {
                let serial_no = format!("{hostname}-{n}");
                let project_id = self.options.project_id.clone();
                let policy = self.options.restart_policy.clone();
                let queue = Arc::clone(&self.queue);
                let factory = self.transport_factory.clone();
                tokio::spawn(async move {
                    run_instance_loop(&project_id, &serial_no, &policy, &queue, factory).await;
                })
            })
            .collect()
    }
}

/// Run one instance until it stops cleanly or runs out of restart
/// attempts. Startup failures count as attempts.
async fn run_instance_loop(
    project_id: &str,
    serial_no: &str,
    policy: &RestartPolicy,
    queue: &Arc<dyn BootstrapQueue>,
    transport_factory: Option<TransportFactory>,
) {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match run_instance(
            project_id,
            serial_no,
            Arc::clone(queue),
            transport_factory.clone(),
        )
        .await
        {
            Ok(device_id) => {
                info!("Instance {} ({}) disconnected, restarting", serial_no, device_id);
            }
            Err(err) => {
                error!("Instance {} failed: {}", serial_no, err);
            }
        }
        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                error!("Instance {} gave up after {} attempts", serial_no, attempts);
                return;
            }
        }
        tokio::time::sleep(policy.backoff).await;
    }
}

async fn run_instance(
    project_id: &str,
    serial_no: &str,
    queue: Arc<dyn BootstrapQueue>,
    transport_factory: Option<TransportFactory>,
) -> Result<String, PubberError> {
    let mut options = PubberOptions::new(DeviceConfig::for_swarm(project_id, serial_no));
    options.queue = Some(queue);
    options.transport_factory = transport_factory;

    let pubber = Pubber::initialize(options).await?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    if !pubber.start_connection(done_tx).await {
        pubber.terminate().await;
        return Err(PubberError::Handshake);
    }

    let device_id = pubber.device_id().to_string();
    info!("Swarm instance {} running as {}", serial_no, device_id);
    done_rx.recv().await;
    pubber.terminate().await;
    Ok(device_id)
}

/// Unbounded in-process bundle feed for tests and local experiments.
pub struct InProcQueue {
    tx: mpsc::UnboundedSender<Bundle>,
    rx: Mutex<mpsc::UnboundedReceiver<Bundle>>,
}

impl InProcQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }

    pub fn push(&self, bundle: Bundle) {
        let _ = self.tx.send(bundle);
    }
}

#[async_trait]
impl BootstrapQueue for InProcQueue {
    async fn pull(&self) -> Result<Bundle, PubberError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| PubberError::Configuration("bootstrap queue closed".to_string()))
    }
}

/// Production bundle feed: a shared MQTT subscription, so concurrent
/// pullers each consume distinct messages.
pub struct MqttQueue {
    rx: Mutex<mpsc::UnboundedReceiver<Bundle>>,
}

impl MqttQueue {
    pub async fn connect(
        subscription: &str,
        hostname: &str,
        port: u16,
    ) -> Result<Arc<Self>, PubberError> {
        let client_id = format!("fieldpub-feed-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, hostname, port);
        options.set_keep_alive(FEED_KEEP_ALIVE);
        let (client, mut eventloop) = AsyncClient::new(options, FEED_CAPACITY);

        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {}
            Ok(_) => {
                return Err(PubberError::Connection(TransportError::Rejected(
                    "unexpected packet before connection acknowledgement".to_string(),
                )))
            }
            Err(err) => {
                return Err(PubberError::Connection(TransportError::Rejected(
                    err.to_string(),
                )))
            }
        }

        let topic = format!("$share/fieldpub/{subscription}");
        client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|_| PubberError::Connection(TransportError::ConnectionClosed))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match serde_json::from_slice::<Bundle>(&publish.payload) {
                            Ok(bundle) => {
                                if tx.send(bundle).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("Ignoring malformed bundle: {}", err),
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // Re-establish the shared subscription after a reconnect.
                        if client.subscribe(&topic, QoS::AtLeastOnce).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("Bundle feed poll failed: {}", err);
                        tokio::time::sleep(PULL_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(Arc::new(Self { rx: Mutex::new(rx) }))
    }
}

#[async_trait]
impl BootstrapQueue for MqttQueue {
    async fn pull(&self) -> Result<Bundle, PubberError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| PubberError::Configuration("bundle feed closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swarm_bundle(device_id: &str) -> Bundle {
        let message = SwarmMessage {
            key_base64: STANDARD.encode(b"secret"),
            device_metadata: None,
        };
        let mut attributes = HashMap::new();
        attributes.insert("subFolder".to_string(), SWARM_SUBFOLDER.to_string());
        attributes.insert("deviceId".to_string(), device_id.to_string());
        attributes.insert("deviceRegistryId".to_string(), "registry-1".to_string());
        attributes.insert(
            "deviceRegistryLocation".to_string(),
            "us-central1".to_string(),
        );
        Bundle {
            attributes,
            body: serde_json::to_value(&message).unwrap(),
        }
    }

    #[test]
    fn test_apply_bundle_populates_config() {
        let mut config = DeviceConfig::for_swarm("proj", "host-1");
        let metadata = apply_bundle(&swarm_bundle("SW-7"), &mut config).unwrap();
        assert!(metadata.is_none());
        assert_eq!(config.device_id.as_deref(), Some("SW-7"));
        assert_eq!(config.registry_id.as_deref(), Some("registry-1"));
        assert_eq!(config.cloud_region.as_deref(), Some("us-central1"));
        assert_eq!(config.key_bytes.as_deref(), Some(b"secret".as_ref()));
    }

    #[test]
    fn test_apply_bundle_requires_attributes() {
        let mut bundle = swarm_bundle("SW-7");
        bundle.attributes.remove("deviceRegistryId");

        let mut config = DeviceConfig::for_swarm("proj", "host-1");
        let err = apply_bundle(&bundle, &mut config).unwrap_err();
        assert!(matches!(err, PubberError::Configuration(_)));
        assert!(config.device_id.is_none());
    }

    #[test]
    fn test_apply_bundle_rejects_bad_key() {
        let mut bundle = swarm_bundle("SW-7");
        bundle.body = serde_json::json!({ "key_base64": "not base64!!" });

        let mut config = DeviceConfig::for_swarm("proj", "host-1");
        let err = apply_bundle(&bundle, &mut config).unwrap_err();
        assert!(matches!(err, PubberError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_bootstrap_skips_foreign_bundles() {
        let queue = InProcQueue::new();

        let mut foreign = swarm_bundle("SW-1");
        foreign
            .attributes
            .insert("subFolder".to_string(), "update".to_string());
        queue.push(foreign);

        let mut invalid = swarm_bundle("SW-2");
        invalid.attributes.remove("deviceId");
        queue.push(invalid);

        queue.push(swarm_bundle("SW-3"));

        let mut config = DeviceConfig::for_swarm("proj", "host-1");
        pull_bootstrap(queue.as_ref(), &mut config).await.unwrap();
        assert_eq!(config.device_id.as_deref(), Some("SW-3"));
    }

    #[test]
    fn test_restart_policy_default() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.backoff, Duration::from_secs(1));
        assert!(policy.max_attempts.is_none());
    }

    #[tokio::test]
    async fn test_in_proc_queue_preserves_order() {
        let queue = InProcQueue::new();
        queue.push(swarm_bundle("SW-1"));
        queue.push(swarm_bundle("SW-2"));

        let first = queue.pull().await.unwrap();
        let second = queue.pull().await.unwrap();
        assert_eq!(first.attributes["deviceId"], "SW-1");
        assert_eq!(second.attributes["deviceId"], "SW-2");
    }
}
