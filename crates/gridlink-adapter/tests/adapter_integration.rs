//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "integration-test"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "End-to-end adapter scenarios over the mock broker."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use gridlink_adapter::{AdapterEvents, AdapterManager, AdapterState, SunSpecAdapter};
use gridlink_bus::{BusClient, MockBroker};
use gridlink_common::config::{ConnectionType, DeviceConfig, Mode, ReconnectConfig};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn mock_device(id: u32, models: Vec<u16>, scan_interval_ms: u64) -> DeviceConfig {
    DeviceConfig {
        id,
        connection_type: ConnectionType::Tcp,
        host: None,
        port: 502,
        path: None,
        baud_rate: None,
        timeout_ms: 1_000,
        mock_mode: true,
        models,
        scan_interval_ms,
    }
}

async fn connected_bus(broker: &MockBroker) -> Arc<BusClient> {
    let client = BusClient::new(Arc::new(broker.attach()), ReconnectConfig::default());
    client.initialize().await.expect("bus connects");
    Arc::new(client)
}

async fn json_subscription(
    broker: &MockBroker,
    pattern: &str,
) -> (Arc<BusClient>, mpsc::UnboundedReceiver<JsonValue>) {
    let consumer = connected_bus(broker).await;
    let (tx, rx) = mpsc::unbounded_channel();
    consumer
        .subscribe(pattern, move |message| {
            if let Some(value) = message.payload.as_json() {
                tx.send(value.clone())?;
            }
            Ok(())
        })
        .await
        .expect("subscribe");
    (consumer, rx)
}

#[tokio::test]
async fn first_scan_fires_immediately() {
    let broker = MockBroker::new();
    let (_consumer, mut telemetry) = json_subscription(&broker, "devices/+/telemetry").await;
    let bus = connected_bus(&broker).await;

    // one-hour interval: only the immediate first cycle can possibly fire
    let adapter = Arc::new(SunSpecAdapter::new(
        mock_device(31, vec![1, 103], 3_600_000),
        bus,
        AdapterEvents::new(),
    ));
    adapter.start_scanning().await.expect("start");

    let envelope = timeout(Duration::from_millis(50), telemetry.recv())
        .await
        .expect("first cycle runs without waiting for the interval")
        .expect("channel open");
    assert_eq!(envelope["deviceId"], 31);
    assert_eq!(envelope["protocol"], "sunspec");
    assert_eq!(envelope["readings"]["common"]["Mn"], "GridLink");
    assert!(envelope["readings"]["inverter"]["W"].is_number());

    adapter.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn steady_cadence_follows_the_scan_interval() {
    let broker = MockBroker::new();
    let (_consumer, mut telemetry) = json_subscription(&broker, "devices/36/telemetry").await;
    let bus = connected_bus(&broker).await;

    let adapter = Arc::new(SunSpecAdapter::new(
        mock_device(36, vec![802], 200),
        bus,
        AdapterEvents::new(),
    ));
    adapter.start_scanning().await.expect("start");

    timeout(Duration::from_millis(50), telemetry.recv())
        .await
        .expect("immediate first cycle")
        .expect("channel open");
    let first_at = std::time::Instant::now();

    timeout(Duration::from_millis(500), telemetry.recv())
        .await
        .expect("second cycle follows")
        .expect("channel open");
    let gap = first_at.elapsed();
    assert!(gap >= Duration::from_millis(150), "second cycle too early: {gap:?}");
    assert!(gap <= Duration::from_millis(450), "second cycle too late: {gap:?}");

    adapter.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn concurrent_starts_spawn_a_single_schedule() {
    let broker = MockBroker::new();
    let (_consumer, mut telemetry) = json_subscription(&broker, "devices/37/telemetry").await;
    let bus = connected_bus(&broker).await;

    // one-hour interval: each schedule would contribute exactly its
    // immediate first cycle
    let adapter = Arc::new(SunSpecAdapter::new(
        mock_device(37, vec![802], 3_600_000),
        bus,
        AdapterEvents::new(),
    ));
    let (first, second) = tokio::join!(adapter.start_scanning(), adapter.start_scanning());
    first.expect("first start");
    second.expect("second start is a no-op");

    timeout(Duration::from_millis(500), telemetry.recv())
        .await
        .expect("one immediate cycle")
        .expect("channel open");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        telemetry.try_recv().is_err(),
        "a second schedule published its own cycle"
    );

    adapter.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn repeated_connects_publish_a_single_online_status() {
    let broker = MockBroker::new();
    let (_consumer, mut status) = json_subscription(&broker, "devices/32/status").await;
    let bus = connected_bus(&broker).await;

    let adapter = Arc::new(SunSpecAdapter::new(
        mock_device(32, vec![1], 3_600_000),
        bus,
        AdapterEvents::new(),
    ));
    adapter.connect().await.expect("first connect");
    adapter.connect().await.expect("second connect is a no-op");
    adapter.connect().await.expect("third connect is a no-op");

    let first = timeout(Duration::from_millis(500), status.recv())
        .await
        .expect("status published")
        .expect("channel open");
    assert_eq!(first["status"], "online");

    // no further status may arrive from the redundant connects
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(status.try_recv().is_err());
}

#[tokio::test]
async fn unknown_model_yields_error_status_and_no_telemetry() {
    let broker = MockBroker::new();
    let (_status_consumer, mut status) = json_subscription(&broker, "devices/33/status").await;
    let (_telemetry_consumer, mut telemetry) =
        json_subscription(&broker, "devices/33/telemetry").await;
    let bus = connected_bus(&broker).await;

    let adapter = Arc::new(SunSpecAdapter::new(
        mock_device(33, vec![999], 20),
        bus,
        AdapterEvents::new(),
    ));
    adapter.start_scanning().await.expect("schedule starts");

    // first status is online from connect, then error from the failing cycle
    let mut saw_error = false;
    for _ in 0..3 {
        let Ok(Some(envelope)) = timeout(Duration::from_millis(500), status.recv()).await else {
            break;
        };
        if envelope["status"] == "error" {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "failing cycle reports error status");
    assert_eq!(adapter.state(), AdapterState::Error);
    assert!(adapter.last_error().unwrap().contains("999"));

    // the schedule keeps running but never publishes readings
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(telemetry.try_recv().is_err());

    adapter.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn stop_scanning_halts_telemetry_but_keeps_the_connection() {
    let broker = MockBroker::new();
    let (_consumer, mut telemetry) = json_subscription(&broker, "devices/34/telemetry").await;
    let bus = connected_bus(&broker).await;

    let adapter = Arc::new(SunSpecAdapter::new(
        mock_device(34, vec![802], 20),
        bus,
        AdapterEvents::new(),
    ));
    adapter.start_scanning().await.expect("start");
    timeout(Duration::from_millis(500), telemetry.recv())
        .await
        .expect("scanning produces telemetry")
        .expect("channel open");

    adapter.stop_scanning();
    assert_eq!(adapter.state(), AdapterState::Connected);

    // drain anything already in flight, then expect silence
    tokio::time::sleep(Duration::from_millis(100)).await;
    while telemetry.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(telemetry.try_recv().is_err());
}

#[tokio::test]
async fn manager_runs_a_mock_fleet_end_to_end() {
    let broker = MockBroker::new();
    let (_consumer, mut telemetry) = json_subscription(&broker, "devices/+/telemetry").await;
    let bus = connected_bus(&broker).await;

    let manager = AdapterManager::new(Mode::Development, bus);
    manager
        .add_device(mock_device(41, vec![1, 103], 25))
        .await
        .expect("inverter added");
    manager
        .add_device(mock_device(42, vec![1, 802], 25))
        .await
        .expect("battery added");
    assert_eq!(manager.device_count(), 2);

    let mut seen = std::collections::HashSet::new();
    while seen.len() < 2 {
        let envelope = timeout(Duration::from_millis(500), telemetry.recv())
            .await
            .expect("fleet telemetry flows")
            .expect("channel open");
        seen.insert(envelope["deviceId"].as_u64().unwrap());
    }
    assert!(seen.contains(&41) && seen.contains(&42));

    manager.shutdown().await;
    assert_eq!(manager.device_count(), 0);

    // retained status now reads offline for both devices
    for id in [41u32, 42] {
        let payload = broker
            .retained_payload(&format!("devices/{id}/status"))
            .expect("status retained");
        let status: JsonValue = serde_json::from_str(&payload).unwrap();
        assert_eq!(status["status"], "offline");
    }
}
