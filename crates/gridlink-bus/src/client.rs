//! ---
//! ems_section: "02-message-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Topic-matched publish/subscribe bus and transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use gridlink_common::config::ReconnectConfig;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::BusMetricsExporter;
use crate::topic::{topic_matches, validate_pattern};
use crate::transport::BrokerTransport;
use crate::types::{BusMessage, BusPayload, OutboundMessage, TransportEvent};
use crate::Result;

type Handler = Arc<dyn Fn(&BusMessage) -> anyhow::Result<()> + Send + Sync>;

/// Identifier for a registered handler, used for targeted unsubscribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct HandlerEntry {
    id: HandlerId,
    handler: Handler,
}

struct Shared {
    transport: Arc<dyn BrokerTransport>,
    reconnect: ReconnectConfig,
    subscriptions: Mutex<IndexMap<String, Vec<HandlerEntry>>>,
    connected: AtomicBool,
    metrics: Option<Arc<BusMetricsExporter>>,
}

/// Single logical connection to the message bus.
///
/// Subscriptions registered while disconnected are queued and applied on the
/// next successful connect; after an unclean transport close the client
/// reconnects with exponential backoff and replays every registered pattern
/// before reporting connected again. Publishing is fire-and-forget: callers
/// needing guaranteed delivery implement their own acknowledgment on top.
pub struct BusClient {
    shared: Arc<Shared>,
    next_handler: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Build a client over the given transport with the given backoff policy.
    pub fn new(transport: Arc<dyn BrokerTransport>, reconnect: ReconnectConfig) -> Self {
        Self::build(transport, reconnect, None)
    }

    /// Build a client that reports bus activity to Prometheus.
    pub fn with_metrics(
        transport: Arc<dyn BrokerTransport>,
        reconnect: ReconnectConfig,
        metrics: Arc<BusMetricsExporter>,
    ) -> Self {
        Self::build(transport, reconnect, Some(metrics))
    }

    fn build(
        transport: Arc<dyn BrokerTransport>,
        reconnect: ReconnectConfig,
        metrics: Option<Arc<BusMetricsExporter>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                reconnect,
                subscriptions: Mutex::new(IndexMap::new()),
                connected: AtomicBool::new(false),
                metrics,
            }),
            next_handler: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        }
    }

    /// Establish the transport connection and start dispatching.
    ///
    /// On failure the client stays usable: registered subscriptions are kept
    /// and applied on the next successful `initialize`.
    pub async fn initialize(&self) -> Result<()> {
        let events = self.shared.transport.events();
        self.shared.transport.connect().await?;
        replay_subscriptions(&self.shared).await;
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = tokio::spawn(dispatch_loop(shared, events));
        if let Some(previous) = self.dispatcher.lock().replace(handle) {
            previous.abort();
        }
        info!(transport = self.shared.transport.name(), "bus client connected");
        Ok(())
    }

    /// Whether the client currently considers itself connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Register `handler` under `pattern`.
    ///
    /// The pattern is validated up front; `#` outside the final segment and
    /// wildcards embedded in a segment are rejected here rather than left to
    /// silently never match.
    pub async fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&BusMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        validate_pattern(pattern)?;
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let first_for_pattern = {
            let mut subscriptions = self.shared.subscriptions.lock();
            let entries = subscriptions.entry(pattern.to_owned()).or_default();
            let first = entries.is_empty();
            entries.push(HandlerEntry {
                id,
                handler: Arc::new(handler),
            });
            first
        };
        if first_for_pattern && self.is_connected() {
            // registration is retained even if this fails; it will be
            // replayed on the next successful connect
            self.shared.transport.subscribe(pattern).await?;
        }
        debug!(pattern, handler = id.0, "subscription registered");
        Ok(id)
    }

    /// Remove a specific handler, or all handlers for `pattern` when `handler`
    /// is `None`. Unknown patterns and ids are no-ops.
    pub async fn unsubscribe(&self, pattern: &str, handler: Option<HandlerId>) -> Result<()> {
        let drop_broker_subscription = {
            let mut subscriptions = self.shared.subscriptions.lock();
            let emptied = match subscriptions.get_mut(pattern) {
                None => false,
                Some(entries) => {
                    match handler {
                        Some(id) => entries.retain(|entry| entry.id != id),
                        None => entries.clear(),
                    }
                    entries.is_empty()
                }
            };
            if emptied {
                subscriptions.shift_remove(pattern);
            }
            emptied
        };
        if drop_broker_subscription && self.is_connected() {
            self.shared.transport.unsubscribe(pattern).await?;
        }
        Ok(())
    }

    /// Publish a message. Returns `false` (never errors) when the client is
    /// disconnected or the transport refuses the publish.
    pub async fn publish(&self, message: OutboundMessage) -> bool {
        if !self.is_connected() {
            warn!(topic = %message.topic, "publish while disconnected; message dropped");
            if let Some(metrics) = &self.shared.metrics {
                metrics.observe_dropped();
            }
            return false;
        }
        let payload = message.wire_payload();
        match self
            .shared
            .transport
            .publish(&message.topic, &payload, message.qos, message.retain)
            .await
        {
            Ok(()) => {
                if let Some(metrics) = &self.shared.metrics {
                    metrics.observe_published();
                }
                true
            }
            Err(err) => {
                warn!(topic = %message.topic, error = %err, "publish failed");
                if let Some(metrics) = &self.shared.metrics {
                    metrics.observe_dropped();
                }
                false
            }
        }
    }

    /// Number of patterns currently registered (connected or not).
    pub fn pattern_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Disconnect cleanly and stop the dispatcher.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.transport.disconnect().await?;
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn replay_subscriptions(shared: &Arc<Shared>) {
    let patterns: Vec<String> = shared.subscriptions.lock().keys().cloned().collect();
    for pattern in patterns {
        if let Err(err) = shared.transport.subscribe(&pattern).await {
            warn!(pattern = %pattern, error = %err, "failed to replay subscription");
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::Message { topic, payload } => {
                deliver(&shared, &topic, &payload);
            }
            TransportEvent::Disconnected { clean: true } => {
                shared.connected.store(false, Ordering::SeqCst);
                debug!("transport closed cleanly; dispatcher exiting");
                break;
            }
            TransportEvent::Disconnected { clean: false } => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!("transport closed uncleanly; starting reconnect");
                match reconnect_with_backoff(&shared).await {
                    Some(new_events) => events = new_events,
                    None => {
                        error!(
                            attempts = shared.reconnect.max_attempts,
                            "reconnect attempts exhausted; bus client parked disconnected"
                        );
                        break;
                    }
                }
            }
        }
    }
}

async fn reconnect_with_backoff(
    shared: &Arc<Shared>,
) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
    for attempt in 1..=shared.reconnect.max_attempts {
        let delay = shared.reconnect.delay_for_attempt(attempt);
        tokio::time::sleep(delay).await;
        let events = shared.transport.events();
        match shared.transport.connect().await {
            Ok(()) => {
                // every registered pattern is replayed before the client
                // reports connected again
                replay_subscriptions(shared).await;
                shared.connected.store(true, Ordering::SeqCst);
                info!(attempt, "transport reconnected");
                return Some(events);
            }
            Err(err) => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "reconnect attempt failed");
            }
        }
    }
    None
}

fn deliver(shared: &Arc<Shared>, topic: &str, payload: &str) {
    // defensive copy: handlers may subscribe/unsubscribe during delivery
    let matched: Vec<(String, Vec<HandlerEntry>)> = {
        let subscriptions = shared.subscriptions.lock();
        subscriptions
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .map(|(pattern, entries)| (pattern.clone(), entries.clone()))
            .collect()
    };
    if matched.is_empty() {
        return;
    }
    let message = BusMessage {
        topic: topic.to_owned(),
        payload: BusPayload::parse(payload),
    };
    if let Some(metrics) = &shared.metrics {
        metrics.observe_delivered();
    }
    for (pattern, entries) in matched {
        for entry in entries {
            if let Err(err) = (entry.handler)(&message) {
                warn!(
                    topic,
                    pattern = %pattern,
                    handler = entry.id.0,
                    error = %err,
                    "subscriber handler failed"
                );
                if let Some(metrics) = &shared.metrics {
                    metrics.observe_handler_failure();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::topic::PatternError;
    use crate::transport::MockBroker;
    use crate::BusError;

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 1,
            multiplier: 1.5,
            max_delay_ms: 5,
            max_attempts: 5,
        }
    }

    async fn connected_pair(broker: &MockBroker) -> (BusClient, BusClient) {
        let publisher = BusClient::new(Arc::new(broker.attach()), fast_reconnect());
        let subscriber = BusClient::new(Arc::new(broker.attach()), fast_reconnect());
        publisher.initialize().await.expect("publisher connects");
        subscriber.initialize().await.expect("subscriber connects");
        (publisher, subscriber)
    }

    #[tokio::test]
    async fn wildcard_subscription_receives_matching_topics() {
        let broker = MockBroker::new();
        let (publisher, subscriber) = connected_pair(&broker).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("devices/+/telemetry", move |message| {
                tx.send(message.topic.clone())?;
                Ok(())
            })
            .await
            .expect("subscribe");

        assert!(
            publisher
                .publish(OutboundMessage::json(
                    "devices/42/telemetry",
                    json!({"w": 1500})
                ))
                .await
        );
        assert!(
            publisher
                .publish(OutboundMessage::json("devices/42/status", json!("online")))
                .await
        );

        let topic = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("delivery in time")
            .expect("channel open");
        assert_eq!(topic, "devices/42/telemetry");
        assert!(rx.try_recv().is_err(), "status topic must not be delivered");
    }

    #[tokio::test]
    async fn malformed_payload_is_delivered_as_raw_text() {
        let broker = MockBroker::new();
        let (publisher, subscriber) = connected_pair(&broker).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("devices/9/telemetry", move |message| {
                tx.send(message.payload.clone())?;
                Ok(())
            })
            .await
            .expect("subscribe");

        // pre-serialized strings pass through verbatim, so this lands on the
        // wire as invalid JSON
        assert!(
            publisher
                .publish(OutboundMessage::json(
                    "devices/9/telemetry",
                    json!("{broken json")
                ))
                .await
        );

        let payload = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("delivery in time")
            .expect("channel open");
        assert_eq!(payload, BusPayload::Text("{broken json".to_owned()));
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_delivery_to_others() {
        let broker = MockBroker::new();
        let (publisher, subscriber) = connected_pair(&broker).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("alerts/#", |_| anyhow::bail!("handler exploded"))
            .await
            .expect("subscribe failing handler");
        subscriber
            .subscribe("alerts/#", move |message| {
                tx.send(message.topic.clone())?;
                Ok(())
            })
            .await
            .expect("subscribe second handler");

        assert!(
            publisher
                .publish(OutboundMessage::json("alerts/grid/overload", json!({})))
                .await
        );
        let topic = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("second handler still delivered")
            .expect("channel open");
        assert_eq!(topic, "alerts/grid/overload");
    }

    #[tokio::test]
    async fn subscriptions_queued_while_disconnected_apply_on_connect() {
        let broker = MockBroker::new();
        let subscriber = BusClient::new(Arc::new(broker.attach()), fast_reconnect());

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("devices/+/status", move |message| {
                tx.send(message.topic.clone())?;
                Ok(())
            })
            .await
            .expect("queued subscribe succeeds while disconnected");
        assert_eq!(subscriber.pattern_count(), 1);

        subscriber.initialize().await.expect("connect");
        let publisher = BusClient::new(Arc::new(broker.attach()), fast_reconnect());
        publisher.initialize().await.expect("connect");

        assert!(
            publisher
                .publish(OutboundMessage::json("devices/3/status", json!("online")))
                .await
        );
        let topic = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("queued subscription was applied")
            .expect("channel open");
        assert_eq!(topic, "devices/3/status");
    }

    #[tokio::test]
    async fn publish_while_disconnected_returns_false() {
        let broker = MockBroker::new();
        let client = BusClient::new(Arc::new(broker.attach()), fast_reconnect());
        assert!(
            !client
                .publish(OutboundMessage::json("devices/1/telemetry", json!({})))
                .await
        );
    }

    #[tokio::test]
    async fn invalid_patterns_are_rejected_at_subscribe_time() {
        let broker = MockBroker::new();
        let client = BusClient::new(Arc::new(broker.attach()), fast_reconnect());
        let err = client
            .subscribe("devices/#/telemetry", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Pattern(PatternError::InteriorHash { position: 1 })
        ));
        assert_eq!(client.pattern_count(), 0);
    }

    #[tokio::test]
    async fn last_handler_removal_drops_the_pattern() {
        let broker = MockBroker::new();
        let client = BusClient::new(Arc::new(broker.attach()), fast_reconnect());
        client.initialize().await.expect("connect");

        let first = client.subscribe("devices/+/status", |_| Ok(())).await.unwrap();
        let second = client.subscribe("devices/+/status", |_| Ok(())).await.unwrap();
        assert_eq!(client.pattern_count(), 1);

        client
            .unsubscribe("devices/+/status", Some(first))
            .await
            .unwrap();
        assert_eq!(client.pattern_count(), 1);
        client
            .unsubscribe("devices/+/status", Some(second))
            .await
            .unwrap();
        assert_eq!(client.pattern_count(), 0);

        // unknown pattern is a no-op, not an error
        client.unsubscribe("devices/unknown", None).await.unwrap();
    }
}
