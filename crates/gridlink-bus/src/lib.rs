//! ---
//! ems_section: "02-message-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Topic-matched publish/subscribe bus and transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! The GridLink message bus: a topic-based publish/subscribe client with
//! `+`/`#` wildcard subscriptions, a mock in-memory broker for tests and
//! simulation, and an MQTT transport for real deployments.

pub mod client;
pub mod metrics;
pub mod topic;
pub mod transport;
pub mod types;

use std::time::Duration;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Error taxonomy for the bus layer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport is not currently connected.
    #[error("transport not connected")]
    NotConnected,
    /// A connection attempt did not reach the open state in time.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// A subscription pattern failed validation.
    #[error("invalid subscription pattern: {0}")]
    Pattern(#[from] topic::PatternError),
    /// The broker rejected or failed a request.
    #[error("broker request failed: {0}")]
    Broker(String),
    /// Wrapper for IO errors encountered during bus operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use client::{BusClient, HandlerId};
pub use metrics::BusMetricsExporter;
pub use topic::{
    command_topic, status_topic, telemetry_topic, topic_matches, validate_pattern, PatternError,
};
pub use transport::{BrokerTransport, MockBroker, MockTransport, MqttTransport};
pub use types::{BusMessage, BusPayload, OutboundMessage, QosLevel, TransportEvent};
