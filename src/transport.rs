use crate::config::DeviceConfig;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::warn;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Transport not connected")]
    NotConnected,
    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Inbound traffic surfaced by a transport after connect.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message {
        device_id: String,
        topic: String,
        payload: Vec<u8>,
    },
    Fault(TransportError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn subscribe(&self, device_id: &str, topic: &str) -> Result<(), TransportError>;
    async fn publish(
        &self,
        device_id: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;

    /// Hand over the inbound event stream. Yields once; later calls return None.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

pub type TransportFactory = Arc<dyn Fn(&DeviceConfig) -> Arc<dyn Transport> + Send + Sync>;

pub fn device_topic(device_id: &str, topic: &str) -> String {
    format!("/devices/{device_id}/{topic}")
}

pub fn parse_device_topic(raw: &str) -> Option<(String, String)> {
    let rest = raw.strip_prefix("/devices/")?;
    let (device_id, topic) = rest.split_once('/')?;
    if device_id.is_empty() || topic.is_empty() {
        return None;
    }
    Some((device_id.to_string(), topic.to_string()))
}

/// MQTT 3.1.1 bridge client. Inbound publishes are decoded against the
/// device topic scheme and forwarded over the event channel; the poll
/// task emits a single Fault when the broker link drops unexpectedly.
pub struct MqttTransport {
    options: MqttOptions,
    client: StdMutex<Option<AsyncClient>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new(client_id: &str, hostname: &str, port: u16) -> Self {
        let mut options = MqttOptions::new(client_id, hostname, port);
        options.set_keep_alive(KEEP_ALIVE);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            options,
            client: StdMutex::new(None),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a transport from device settings, wiring key material into
    /// the broker credentials when it was loaded.
    pub fn from_config(config: &DeviceConfig) -> Self {
        let project = config.project_id.as_deref().unwrap_or("local");
        let device_id = config.device_id.as_deref().unwrap_or_default();
        let client_id = format!("projects/{project}/devices/{device_id}");

        let mut transport = Self::new(&client_id, &config.bridge_hostname, config.bridge_port);
        if let Some(key_bytes) = &config.key_bytes {
            let password = STANDARD.encode(key_bytes);
            transport.options.set_credentials("unused", password);
        }
        transport
    }

    fn client_handle(&self) -> Result<AsyncClient, TransportError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.closed.store(false, Ordering::SeqCst);
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), EVENT_CAPACITY);

        // The first poll drives the handshake; anything but an
        // acknowledgement means the broker turned us away.
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {}
            Ok(_) => {
                return Err(TransportError::Rejected(
                    "unexpected packet before connection acknowledgement".to_string(),
                ))
            }
            Err(err) => return Err(TransportError::Rejected(err.to_string())),
        }

        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);

        let events_tx = self.events_tx.clone();
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let Some((device_id, topic)) = parse_device_topic(&publish.topic) else {
                            warn!("Ignoring message on unrecognized topic {}", publish.topic);
                            continue;
                        };
                        let event = TransportEvent::Message {
                            device_id,
                            topic,
                            payload: publish.payload.to_vec(),
                        };
                        if events_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if !closed.load(Ordering::SeqCst) {
                            warn!("Broker connection lost: {}", err);
                            let _ =
                                events_tx.send(TransportEvent::Fault(TransportError::ConnectionClosed));
                        }
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn subscribe(&self, device_id: &str, topic: &str) -> Result<(), TransportError> {
        let client = self.client_handle()?;
        client
            .subscribe(device_topic(device_id, topic), QoS::AtLeastOnce)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn publish(
        &self,
        device_id: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let client = self.client_handle()?;
        client
            .publish(device_topic(device_id, topic), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Ok(()),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Outbound message captured by the in-process bus.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub device_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub at: Instant,
}

/// Loopback transport for exercising agents without a broker. Records
/// every publish with its timestamp and lets callers inject inbound
/// messages and link faults.
#[derive(Default)]
pub struct InProcBus {
    connected: AtomicBool,
    closed: AtomicBool,
    fail_connect: AtomicBool,
    subscriptions: StdMutex<Vec<(String, String)>>,
    published: StdMutex<Vec<PublishedMessage>>,
    notify: Notify,
    events: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    events_tx: StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl InProcBus {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self::default();
        *bus.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        *bus.events_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Arc::new(bus)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Deliver an inbound message as if the broker pushed it.
    pub fn inject(&self, device_id: &str, topic: &str, payload: Vec<u8>) {
        let event = TransportEvent::Message {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            payload,
        };
        self.send_event(event);
    }

    /// Simulate an unexpected link drop.
    pub fn inject_fault(&self) {
        self.send_event(TransportEvent::Fault(TransportError::ConnectionClosed));
    }

    fn send_event(&self, event: TransportEvent) {
        let tx = self
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    /// Park until at least `count` messages landed on `topic`. Callers
    /// bound this with a timeout.
    pub async fn wait_for_published(&self, topic: &str, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.published_to(topic).len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for InProcBus {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("bus offline".to_string()));
        }
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, device_id: &str, topic: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device_id.to_string(), topic.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        device_id: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let message = PublishedMessage {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            payload,
            at: Instant::now(),
        };
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Deliberate close never raises a Fault event.
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_topic_layout() {
        assert_eq!(device_topic("AHU-1", "config"), "/devices/AHU-1/config");
        assert_eq!(
            device_topic("GAT-123", "events/pointset"),
            "/devices/GAT-123/events/pointset"
        );
    }

    #[test]
    fn test_parse_device_topic() {
        let (device_id, topic) = parse_device_topic("/devices/AHU-1/events/system").unwrap();
        assert_eq!(device_id, "AHU-1");
        assert_eq!(topic, "events/system");

        assert!(parse_device_topic("/devices/AHU-1").is_none());
        assert!(parse_device_topic("/devices//config").is_none());
        assert!(parse_device_topic("/other/AHU-1/config").is_none());
    }

    #[tokio::test]
    async fn test_bus_requires_connect() {
        let bus = InProcBus::new();

        let result = bus.publish("AHU-1", "state", b"{}".to_vec()).await;
        assert_eq!(result, Err(TransportError::NotConnected));

        bus.connect().await.unwrap();
        bus.publish("AHU-1", "state", b"{}".to_vec()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_bus_rejects_publish_after_close() {
        let bus = InProcBus::new();
        bus.connect().await.unwrap();
        bus.close().await.unwrap();

        let result = bus.publish("AHU-1", "state", b"{}".to_vec()).await;
        assert_eq!(result, Err(TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_bus_connect_failure() {
        let bus = InProcBus::new();
        bus.set_fail_connect(true);
        assert!(bus.connect().await.is_err());

        bus.set_fail_connect(false);
        assert!(bus.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_bus_delivers_injected_messages() {
        let bus = InProcBus::new();
        let mut events = bus.take_events().unwrap();
        assert!(bus.take_events().is_none());

        bus.inject("AHU-1", "config", b"{}".to_vec());
        match events.recv().await.unwrap() {
            TransportEvent::Message {
                device_id,
                topic,
                payload,
            } => {
                assert_eq!(device_id, "AHU-1");
                assert_eq!(topic, "config");
                assert_eq!(payload, b"{}");
            }
            TransportEvent::Fault(_) => panic!("expected message event"),
        }

        bus.inject_fault();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Fault(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_bus_wait_for_published() {
        let bus = InProcBus::new();
        bus.connect().await.unwrap();

        let waiter = Arc::clone(&bus);
        let handle = tokio::spawn(async move {
            waiter.wait_for_published("state", 2).await;
        });

        bus.publish("AHU-1", "state", b"1".to_vec()).await.unwrap();
        bus.publish("AHU-1", "events/system", b"x".to_vec())
            .await
            .unwrap();
        bus.publish("AHU-1", "state", b"2".to_vec()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bus.published_to("state").len(), 2);
    }
}
