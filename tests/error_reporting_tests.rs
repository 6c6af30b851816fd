use fieldpub::transport::{InProcBus, Transport, TransportFactory};
use fieldpub::{DeviceConfig, Pubber, PubberError, PubberOptions};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

static OUT_SEQ: AtomicU64 = AtomicU64::new(0);

fn unique_dir(tag: &str) -> PathBuf {
    let seq = OUT_SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("fieldpub-{tag}-{}-{seq}", std::process::id()))
}

fn device_config(device_id: &str, tag: &str) -> DeviceConfig {
    DeviceConfig {
        device_id: Some(device_id.to_string()),
        serial_no: Some("SN-1".to_string()),
        key_bytes: Some(b"test-key".to_vec()),
        out_dir: unique_dir(tag),
        verbose: false,
        ..DeviceConfig::default()
    }
}

fn factory_for(bus: &Arc<InProcBus>) -> TransportFactory {
    let bus = Arc::clone(bus);
    Arc::new(move |_config: &DeviceConfig| Arc::clone(&bus) as Arc<dyn Transport>)
}

async fn eventually<F: FnMut() -> bool>(what: &str, mut cond: F) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn start_and_configure(
    pubber: &Arc<Pubber>,
    bus: &Arc<InProcBus>,
    config: &Value,
) -> mpsc::UnboundedReceiver<()> {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let starter = {
        let pubber = Arc::clone(pubber);
        tokio::spawn(async move { pubber.start_connection(done_tx).await })
    };
    eventually("config subscription", || !bus.subscriptions().is_empty()).await;
    bus.inject(pubber.device_id(), "config", config.to_string().into_bytes());
    assert!(starter.await.unwrap(), "startup handshake failed");
    done_rx
}

fn state_at(bus: &InProcBus, index: usize) -> Value {
    let states = bus.published_to("state");
    serde_json::from_slice(&states[index].payload).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_malformed_config_surfaces_status() {
    let bus = InProcBus::new();
    let mut options = PubberOptions::new(device_config("AHU-1", "malformed"));
    options.transport_factory = Some(factory_for(&bus));
    let pubber = Pubber::initialize(options).await.unwrap();

    let _done_rx = start_and_configure(&pubber, &bus, &json!({})).await;

    bus.inject("AHU-1", "config", b"{not json".to_vec());
    timeout(Duration::from_secs(60), bus.wait_for_published("state", 2))
        .await
        .unwrap();

    let status = &state_at(&bus, 1)["system"]["statuses"]["config_error"];
    assert_eq!(status["level"], 800);
    assert_eq!(status["category"], "device.config");
    assert!(status["message"]
        .as_str()
        .unwrap()
        .starts_with("Config message error"));
    assert!(status["detail"].is_string());

    // The error rides the state document only; the log feed stays quiet
    assert!(bus.published_to("events/system").is_empty());

    pubber.terminate().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_clears_on_next_valid_config() {
    let bus = InProcBus::new();
    let mut options = PubberOptions::new(device_config("AHU-2", "clears"));
    options.transport_factory = Some(factory_for(&bus));
    let pubber = Pubber::initialize(options).await.unwrap();

    let _done_rx = start_and_configure(&pubber, &bus, &json!({})).await;

    bus.inject("AHU-2", "config", b"{not json".to_vec());
    timeout(Duration::from_secs(60), bus.wait_for_published("state", 2))
        .await
        .unwrap();

    // A clean apply publishes state twice: once with the stale status
    // still attached, once after the clear.
    bus.inject("AHU-2", "config", json!({}).to_string().into_bytes());
    timeout(Duration::from_secs(60), bus.wait_for_published("state", 4))
        .await
        .unwrap();

    assert!(state_at(&bus, 1)["system"]["statuses"]
        .as_object()
        .unwrap()
        .contains_key("config_error"));
    assert!(state_at(&bus, 2)["system"]["statuses"]
        .as_object()
        .unwrap()
        .contains_key("config_error"));
    assert!(state_at(&bus, 3)["system"]["statuses"]
        .as_object()
        .unwrap()
        .is_empty());

    pubber.terminate().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_fault_signals_done() {
    let bus = InProcBus::new();
    let mut options = PubberOptions::new(device_config("AHU-3", "fault"));
    options.transport_factory = Some(factory_for(&bus));
    let pubber = Pubber::initialize(options).await.unwrap();

    let mut done_rx = start_and_configure(&pubber, &bus, &json!({})).await;

    bus.inject_fault();
    let signal = timeout(Duration::from_secs(60), done_rx.recv()).await.unwrap();
    assert_eq!(signal, Some(()));

    let states = bus.published_to("state");
    let last: Value = serde_json::from_slice(&states.last().unwrap().payload).unwrap();
    assert_eq!(
        last["system"]["statuses"]["config_error"]["category"],
        "device.connection"
    );

    pubber.terminate().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_during_startup_releases_gate() {
    let bus = InProcBus::new();
    let mut options = PubberOptions::new(device_config("AHU-4", "gate"));
    options.transport_factory = Some(factory_for(&bus));
    let pubber = Pubber::initialize(options).await.unwrap();

    let (done_tx, _done_rx) = mpsc::unbounded_channel();
    let starter = {
        let pubber = Arc::clone(&pubber);
        tokio::spawn(async move { pubber.start_connection(done_tx).await })
    };
    eventually("config subscription", || !bus.subscriptions().is_empty()).await;

    // No valid config ever arrives, but the error report unblocks startup
    // so the device can surface its status instead of hanging.
    bus.inject("AHU-4", "config", b"garbage".to_vec());
    assert!(starter.await.unwrap());
    assert!(pubber.is_started());

    let state = state_at(&bus, 0);
    assert!(state["system"]["statuses"]
        .as_object()
        .unwrap()
        .contains_key("config_error"));

    pubber.terminate().await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_without_status_is_quiet() {
    let bus = InProcBus::new();
    let mut options = PubberOptions::new(device_config("AHU-5", "quiet"));
    options.transport_factory = Some(factory_for(&bus));
    let pubber = Pubber::initialize(options).await.unwrap();

    let _done_rx = start_and_configure(&pubber, &bus, &json!({})).await;
    assert_eq!(bus.published_to("state").len(), 1);

    // Clearing when nothing is pending publishes nothing
    pubber.report_error(None).await;
    assert_eq!(bus.published_to("state").len(), 1);

    pubber.report_error(Some(&PubberError::Handshake)).await;
    assert_eq!(bus.published_to("state").len(), 2);
    assert_eq!(
        state_at(&bus, 1)["system"]["statuses"]["config_error"]["category"],
        "device.start"
    );

    pubber.report_error(None).await;
    assert_eq!(bus.published_to("state").len(), 3);
    pubber.report_error(None).await;
    assert_eq!(bus.published_to("state").len(), 3);

    // Error reports never publish log events
    assert!(bus.published_to("events/system").is_empty());

    pubber.terminate().await;
}
