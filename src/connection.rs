use crate::agent::PubberError;
use crate::transport::{device_topic, Transport, TransportEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

type HandlerKey = (String, String);

pub type MessageHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), PubberError>> + Send + Sync>;

/// Routes inbound messages to registered handlers and mirrors every
/// outbound message into the capture directory.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<HandlerKey, MessageHandler>>,
    out_dir: PathBuf,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, out_dir: PathBuf) -> Self {
        Self {
            transport,
            handlers: RwLock::new(HashMap::new()),
            out_dir,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a typed handler for messages addressed to `device_id` on
    /// `topic`. Empty and literal-null payloads decode to None.
    pub fn register_handler<T, F, Fut>(&self, device_id: &str, topic: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Option<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PubberError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: MessageHandler = Arc::new(move |payload: Vec<u8>| {
            let handler = Arc::clone(&handler);
            async move {
                let decoded: Option<T> = if payload.is_empty() {
                    None
                } else {
                    serde_json::from_slice::<Option<T>>(&payload).map_err(|err| {
                        PubberError::Config(format!("Malformed message payload: {err}"))
                    })?
                };
                handler(decoded).await
            }
            .boxed()
        });

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((device_id.to_string(), topic.to_string()), wrapped);
    }

    /// Open the transport and subscribe every registered route. A repeat
    /// call while connected is a no-op.
    pub async fn connect(&self) -> Result<(), PubberError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.store(false, Ordering::SeqCst);

        if let Err(err) = self.transport.connect().await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(err.into());
        }

        let routes: Vec<HandlerKey> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for (device_id, topic) in routes {
            if let Err(err) = self.transport.subscribe(&device_id, &topic).await {
                self.connected.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
            info!("Subscribed to {}", device_topic(&device_id, &topic));
        }
        Ok(())
    }

    /// Run the handler registered for this route, dropping the message
    /// with a warning when none exists.
    pub async fn dispatch(
        &self,
        device_id: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), PubberError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(device_id.to_string(), topic.to_string()))
            .cloned();
        match handler {
            Some(handler) => handler(payload).await,
            None => {
                warn!("No handler registered for {} message to {}", topic, device_id);
                Ok(())
            }
        }
    }

    /// Serialize and send a message, then mirror it to the capture
    /// directory. Messages sent after close are dropped quietly.
    pub async fn publish<T: Serialize>(
        &self,
        device_id: &str,
        topic: &str,
        message: &T,
    ) -> Result<(), PubberError> {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Dropping {} message after close", topic);
            return Ok(());
        }
        let payload = serde_json::to_vec(message)?;
        self.transport
            .publish(device_id, topic, payload.clone())
            .await?;
        self.write_capture(topic, &payload)?;
        Ok(())
    }

    /// Mirror a raw payload under the capture directory, one file per
    /// topic with slashes flattened to underscores.
    pub fn write_capture(&self, topic: &str, payload: &[u8]) -> Result<(), PubberError> {
        let file_name = format!("{}.json", topic.replace('/', "_"));
        let path = self.out_dir.join(file_name);
        fs::write(&path, payload).map_err(|source| PubberError::Io {
            context: format!("writing message capture {}", path.display()),
            source,
        })
    }

    /// Close the transport. A repeat call is a no-op.
    pub async fn close(&self) -> Result<(), PubberError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        self.transport.close().await?;
        Ok(())
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.transport.take_events()
    }
}
