//! ---
//! ems_section: "02-message-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Topic-matched publish/subscribe bus and transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Delivery guarantee requested for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Broker-acknowledged, may duplicate.
    AtLeastOnce,
    /// Broker-deduplicated.
    ExactlyOnce,
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Event surfaced by a transport to the bus client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The underlying connection reached the open state.
    Connected,
    /// The connection closed. `clean` distinguishes an intentional
    /// disconnect from a failure that should trigger reconnection.
    Disconnected {
        /// True when the close was requested locally.
        clean: bool,
    },
    /// An inbound message on a concrete topic.
    Message {
        /// Concrete topic the message was published on.
        topic: String,
        /// Raw payload as received from the wire.
        payload: String,
    },
}

/// Payload of an inbound message after deserialization.
///
/// Malformed JSON falls back to the raw text rather than being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum BusPayload {
    /// Payload parsed as JSON.
    Json(JsonValue),
    /// Raw payload kept verbatim after a parse failure.
    Text(String),
}

impl BusPayload {
    /// Deserialize a wire payload, falling back to the raw string.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(value) => BusPayload::Json(value),
            Err(_) => BusPayload::Text(raw.to_owned()),
        }
    }

    /// Borrow the payload as JSON, if it parsed.
    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            BusPayload::Json(value) => Some(value),
            BusPayload::Text(_) => None,
        }
    }
}

/// Message handed to subscriber handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Concrete topic the message arrived on.
    pub topic: String,
    /// Deserialized payload.
    pub payload: BusPayload,
}

/// Message handed to [`crate::BusClient::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Concrete topic to publish on. Wildcards are not valid here.
    pub topic: String,
    /// Payload; JSON strings are forwarded verbatim, everything else is
    /// serialized before hitting the wire.
    pub payload: JsonValue,
    /// Requested delivery guarantee.
    pub qos: QosLevel,
    /// Ask the broker to retain the message for late subscribers.
    pub retain: bool,
}

impl OutboundMessage {
    /// Build a QoS-0, non-retained message around a JSON payload.
    pub fn json(topic: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos: QosLevel::AtMostOnce,
            retain: false,
        }
    }

    /// Override the delivery guarantee.
    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    /// Mark the message as retained.
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Serialize the payload for the wire. Strings pass through untouched so
    /// callers can forward pre-serialized bodies.
    pub fn wire_payload(&self) -> String {
        match &self.payload {
            JsonValue::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_parse_falls_back_to_raw_text() {
        assert_eq!(
            BusPayload::parse(r#"{"a":1}"#),
            BusPayload::Json(json!({"a": 1}))
        );
        assert_eq!(
            BusPayload::parse("not json at all {"),
            BusPayload::Text("not json at all {".to_owned())
        );
    }

    #[test]
    fn wire_payload_passes_strings_through() {
        let pre_serialized = OutboundMessage::json("t", JsonValue::String("{\"x\":1}".into()));
        assert_eq!(pre_serialized.wire_payload(), "{\"x\":1}");

        let structured = OutboundMessage::json("t", json!({"x": 1}));
        assert_eq!(structured.wire_payload(), r#"{"x":1}"#);
    }

    #[test]
    fn builders_set_qos_and_retain() {
        let msg = OutboundMessage::json("t", json!(1))
            .with_qos(QosLevel::AtLeastOnce)
            .retained();
        assert_eq!(msg.qos, QosLevel::AtLeastOnce);
        assert!(msg.retain);
    }
}
