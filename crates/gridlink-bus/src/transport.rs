//! ---
//! ems_section: "02-message-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Topic-matched publish/subscribe bus and transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::topic::topic_matches;
use crate::types::{QosLevel, TransportEvent};
use crate::{BusError, Result};

/// Broker connection used by the bus client.
///
/// Call [`events`](BrokerTransport::events) to obtain the inbound event
/// stream before each [`connect`](BrokerTransport::connect); every call
/// replaces the transport's event sink.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open the connection. Idempotent when already connected.
    async fn connect(&self) -> Result<()>;
    /// Close the connection cleanly.
    async fn disconnect(&self) -> Result<()>;
    /// Register a subscription pattern with the broker.
    async fn subscribe(&self, pattern: &str) -> Result<()>;
    /// Remove a subscription pattern from the broker.
    async fn unsubscribe(&self, pattern: &str) -> Result<()>;
    /// Publish a raw payload on a concrete topic.
    async fn publish(&self, topic: &str, payload: &str, qos: QosLevel, retain: bool) -> Result<()>;
    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;
    /// Hand out the inbound event stream, replacing any previous sink.
    fn events(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Mock broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    next_client: u64,
    clients: HashMap<u64, ClientSlot>,
    retained: HashMap<String, String>,
}

struct ClientSlot {
    online: bool,
    subscriptions: HashSet<String>,
    sink: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// In-memory broker hub with synchronous fan-out through the topic matcher.
///
/// Reconnecting a client clears its broker-side subscriptions, mirroring a
/// broker restart, so client-side resubscription is genuinely exercised in
/// tests and simulation runs.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    /// Create an empty broker hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new client and return its transport handle.
    pub fn attach(&self) -> MockTransport {
        let mut state = self.state.lock();
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(
            id,
            ClientSlot {
                online: false,
                subscriptions: HashSet::new(),
                sink: None,
            },
        );
        MockTransport {
            id,
            broker: self.clone(),
        }
    }

    /// Drop every open connection uncleanly, as a crashed broker would.
    pub fn drop_all_connections(&self) {
        let mut state = self.state.lock();
        for slot in state.clients.values_mut() {
            if slot.online {
                slot.online = false;
                if let Some(sink) = &slot.sink {
                    let _ = sink.send(TransportEvent::Disconnected { clean: false });
                }
            }
        }
    }

    /// Retained payload for a concrete topic, if any.
    pub fn retained_payload(&self, topic: &str) -> Option<String> {
        self.state.lock().retained.get(topic).cloned()
    }

    fn connect_client(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.clients.get_mut(&id) {
            slot.online = true;
            // broker restart semantics: the server side remembers nothing
            slot.subscriptions.clear();
            if let Some(sink) = &slot.sink {
                let _ = sink.send(TransportEvent::Connected);
            }
        }
    }

    fn disconnect_client(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.clients.get_mut(&id) {
            if slot.online {
                slot.online = false;
                if let Some(sink) = &slot.sink {
                    let _ = sink.send(TransportEvent::Disconnected { clean: true });
                }
            }
        }
    }

    fn subscribe_client(&self, id: u64, pattern: &str) -> Result<()> {
        let mut state = self.state.lock();
        let retained: Vec<(String, String)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(pattern, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();
        let slot = state.clients.get_mut(&id).ok_or(BusError::NotConnected)?;
        if !slot.online {
            return Err(BusError::NotConnected);
        }
        slot.subscriptions.insert(pattern.to_owned());
        if let Some(sink) = &slot.sink {
            for (topic, payload) in retained {
                let _ = sink.send(TransportEvent::Message { topic, payload });
            }
        }
        Ok(())
    }

    fn unsubscribe_client(&self, id: u64, pattern: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(slot) = state.clients.get_mut(&id) {
            slot.subscriptions.remove(pattern);
        }
        Ok(())
    }

    fn publish_from(&self, id: u64, topic: &str, payload: &str, retain: bool) -> Result<()> {
        let mut state = self.state.lock();
        let publisher_online = state
            .clients
            .get(&id)
            .map(|slot| slot.online)
            .unwrap_or(false);
        if !publisher_online {
            return Err(BusError::NotConnected);
        }
        if retain {
            // empty retained payload clears the slot, MQTT-style
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_owned(), payload.to_owned());
            }
        }
        for slot in state.clients.values() {
            if !slot.online {
                continue;
            }
            let matched = slot
                .subscriptions
                .iter()
                .any(|pattern| topic_matches(pattern, topic));
            if matched {
                if let Some(sink) = &slot.sink {
                    let _ = sink.send(TransportEvent::Message {
                        topic: topic.to_owned(),
                        payload: payload.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    fn set_sink(&self, id: u64, sink: mpsc::UnboundedSender<TransportEvent>) {
        let mut state = self.state.lock();
        if let Some(slot) = state.clients.get_mut(&id) {
            slot.sink = Some(sink);
        }
    }

    fn is_online(&self, id: u64) -> bool {
        self.state
            .lock()
            .clients
            .get(&id)
            .map(|slot| slot.online)
            .unwrap_or(false)
    }
}

/// Per-client handle onto a [`MockBroker`].
pub struct MockTransport {
    id: u64,
    broker: MockBroker,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        if self.broker.is_online(self.id) {
            return Ok(());
        }
        self.broker.connect_client(self.id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.disconnect_client(self.id);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        self.broker.subscribe_client(self.id, pattern)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.broker.unsubscribe_client(self.id, pattern)
    }

    async fn publish(&self, topic: &str, payload: &str, _qos: QosLevel, retain: bool) -> Result<()> {
        self.broker.publish_from(self.id, topic, payload, retain)
    }

    fn is_connected(&self) -> bool {
        self.broker.is_online(self.id)
    }

    fn events(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.set_sink(self.id, tx);
        rx
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// MQTT broker
// ---------------------------------------------------------------------------

/// MQTT transport backed by rumqttc.
///
/// The event loop is pumped by a spawned task that forwards broker packets
/// as [`TransportEvent`]s. A poll error is surfaced as an unclean disconnect
/// and the pump exits; the bus client owns the reconnect policy.
pub struct MqttTransport {
    options: MqttOptions,
    connect_timeout: Duration,
    connected: Arc<AtomicBool>,
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    client: Mutex<Option<AsyncClient>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Default time allowed for a connection attempt to reach the open state.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Build a transport for the given broker endpoint.
    pub fn new(client_id: &str, host: &str, port: u16, keep_alive: Duration) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(keep_alive);
        Self {
            options,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            connected: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(Mutex::new(None)),
            client: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Override the connection open timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn current_client(&self) -> Result<AsyncClient> {
        self.client.lock().clone().ok_or(BusError::NotConnected)
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), 64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let sink = self.sink.clone();
        let connected = self.connected.clone();

        let pump = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(());
                        }
                        if let Some(sink) = sink.lock().as_ref() {
                            let _ = sink.send(TransportEvent::Connected);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        if let Some(sink) = sink.lock().as_ref() {
                            let _ = sink.send(TransportEvent::Message {
                                topic: publish.topic.clone(),
                                payload,
                            });
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        if let Some(sink) = sink.lock().as_ref() {
                            let _ = sink.send(TransportEvent::Disconnected { clean: true });
                        }
                        break;
                    }
                    Ok(event) => {
                        debug!(?event, "mqtt event");
                    }
                    Err(err) => {
                        warn!(error = %err, "mqtt event loop error");
                        connected.store(false, Ordering::SeqCst);
                        if let Some(sink) = sink.lock().as_ref() {
                            let _ = sink.send(TransportEvent::Disconnected { clean: false });
                        }
                        break;
                    }
                }
            }
        });

        *self.client.lock() = Some(client);
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }

        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                // force-close the half-open handle
                if let Some(pump) = self.pump.lock().take() {
                    pump.abort();
                }
                *self.client.lock() = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(BusError::ConnectTimeout(self.connect_timeout))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let client = match self.client.lock().take() {
            Some(client) => client,
            None => return Ok(()),
        };
        self.connected.store(false, Ordering::SeqCst);
        client
            .disconnect()
            .await
            .map_err(|err| BusError::Broker(err.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        let client = self.current_client()?;
        client
            .subscribe(pattern, rumqttc::QoS::AtLeastOnce)
            .await
            .map_err(|err| BusError::Broker(err.to_string()))
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let client = self.current_client()?;
        client
            .unsubscribe(pattern)
            .await
            .map_err(|err| BusError::Broker(err.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &str, qos: QosLevel, retain: bool) -> Result<()> {
        let client = self.current_client()?;
        client
            .publish(topic, qos.into(), retain, payload.as_bytes())
            .await
            .map_err(|err| BusError::Broker(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sink.lock() = Some(tx);
        rx
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_broker_routes_by_pattern() {
        let broker = MockBroker::new();
        let publisher = broker.attach();
        let subscriber = broker.attach();

        let mut events = subscriber.events();
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();
        // consume the Connected event
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        subscriber.subscribe("devices/+/telemetry").await.unwrap();
        publisher
            .publish("devices/42/telemetry", "{}", QosLevel::AtMostOnce, false)
            .await
            .unwrap();
        publisher
            .publish("devices/42/status", "{}", QosLevel::AtMostOnce, false)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::Message {
                topic: "devices/42/telemetry".to_owned(),
                payload: "{}".to_owned(),
            }
        );
        // the status publish must not have been delivered
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn mock_broker_publish_requires_connection() {
        let broker = MockBroker::new();
        let transport = broker.attach();
        let err = transport
            .publish("devices/1/status", "x", QosLevel::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn retained_messages_reach_late_subscribers() {
        let broker = MockBroker::new();
        let publisher = broker.attach();
        publisher.connect().await.unwrap();
        publisher
            .publish("devices/7/status", "online", QosLevel::AtMostOnce, true)
            .await
            .unwrap();
        assert_eq!(
            broker.retained_payload("devices/7/status").as_deref(),
            Some("online")
        );

        let late = broker.attach();
        let mut events = late.events();
        late.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        late.subscribe("devices/+/status").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Message {
                topic: "devices/7/status".to_owned(),
                payload: "online".to_owned(),
            })
        );

        // empty retained payload clears the slot
        publisher
            .publish("devices/7/status", "", QosLevel::AtMostOnce, true)
            .await
            .unwrap();
        assert!(broker.retained_payload("devices/7/status").is_none());
    }

    #[tokio::test]
    async fn reconnect_clears_broker_side_subscriptions() {
        let broker = MockBroker::new();
        let transport = broker.attach();
        let mut events = transport.events();
        transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        transport.subscribe("devices/#").await.unwrap();

        broker.drop_all_connections();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected { clean: false })
        );

        transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        // without resubscription nothing is delivered
        transport
            .publish("devices/1/telemetry", "{}", QosLevel::AtMostOnce, false)
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }
}
