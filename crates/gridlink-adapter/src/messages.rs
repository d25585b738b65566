//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelopes published by device adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Telemetry and status envelopes.

use chrono::{DateTime, Utc};
use gridlink_bus::{status_topic, telemetry_topic, OutboundMessage, QosLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::model::DataBlock;

/// Protocol tag carried in every telemetry envelope.
pub const PROTOCOL_SUNSPEC: &str = "sunspec";

/// Reported lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Connected and scanning.
    Online,
    /// Deliberately disconnected.
    Offline,
    /// A connect or scan failure was recorded.
    Error,
    /// Taken out of service by an operator.
    Maintenance,
    /// Connected but not scanning.
    Standby,
}

/// One scan cycle's readings for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// Numeric device identifier.
    pub device_id: u32,
    /// Shared acquisition timestamp for every block in the cycle.
    pub timestamp: DateTime<Utc>,
    /// Source protocol tag.
    pub protocol: String,
    /// Map of model key to point-id/value object.
    pub readings: JsonValue,
}

impl TelemetryMessage {
    /// Build an envelope from the blocks of one completed scan cycle.
    pub fn from_blocks(device_id: u32, timestamp: DateTime<Utc>, blocks: &[DataBlock]) -> Self {
        let mut readings = serde_json::Map::new();
        for block in blocks {
            readings.insert(block.model_key.to_owned(), block.to_json());
        }
        Self {
            device_id,
            timestamp,
            protocol: PROTOCOL_SUNSPEC.to_owned(),
            readings: JsonValue::Object(readings),
        }
    }

    /// Outbound bus message on the device's telemetry topic.
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage::json(
            telemetry_topic(self.device_id),
            serde_json::to_value(self).unwrap_or(JsonValue::Null),
        )
    }
}

/// Lifecycle announcement for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Numeric device identifier.
    pub device_id: u32,
    /// Reported state.
    pub status: DeviceStatus,
    /// When the state was observed.
    pub timestamp: DateTime<Utc>,
    /// Free-form context, typically an error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl StatusMessage {
    /// Build a status envelope stamped with the current time.
    pub fn now(device_id: u32, status: DeviceStatus, details: Option<String>) -> Self {
        Self {
            device_id,
            status,
            timestamp: Utc::now(),
            details,
        }
    }

    /// Outbound bus message on the device's status topic.
    ///
    /// Status is published retained so late consumers see the last known
    /// state without waiting for the next transition.
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage::json(
            status_topic(self.device_id),
            serde_json::to_value(self).unwrap_or(JsonValue::Null),
        )
        .with_qos(QosLevel::AtLeastOnce)
        .retained()
    }
}
