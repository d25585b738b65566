//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "SunSpec device adapters and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Protocol adapters for the GridLink telemetry core.
//!
//! A [`SunSpecAdapter`] owns one device's connection lifecycle and scan loop,
//! normalizes register data into typed [`model::DataBlock`]s, and publishes
//! telemetry and status envelopes on the message bus. The [`AdapterManager`]
//! keeps the fleet registry and orchestrates startup and shutdown.

pub mod events;
pub mod link;
pub mod manager;
pub mod messages;
pub mod model;
pub mod sunspec;
pub mod synth;

use std::time::Duration;

/// Shared result type for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Error taxonomy for the adapter layer.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Wrapper for IO errors on the register link.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The link did not answer within the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The device answered with a Modbus exception.
    #[error("modbus exception 0x{0:02x}")]
    Exception(u8),
    /// The response frame was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The device did not present the SunSpec identifier at the base address.
    #[error("device did not present the SunSpec identifier")]
    NotSunSpec,
    /// A configured model id has no schema definition.
    #[error("unknown model id {0}")]
    UnknownModel(u16),
    /// A configured model was not found in the device's model chain.
    #[error("model {0} not present on device")]
    ModelNotPresent(u16),
    /// A mandatory point was absent from a data block.
    #[error("mandatory point {point} missing from model {model}")]
    MissingPoint {
        /// Model the point belongs to.
        model: u16,
        /// Point identifier.
        point: &'static str,
    },
    /// No adapter is registered for the requested device.
    #[error("no adapter registered for device {0}")]
    UnknownDevice(u32),
    /// The requested link type is not available in this build.
    #[error("unsupported link: {0}")]
    Unsupported(&'static str),
    /// Bounded connect retries were exhausted.
    #[error("connect attempts exhausted for device {0}")]
    ConnectExhausted(u32),
    /// The register link is not open.
    #[error("register link is not open")]
    LinkClosed,
}

pub use events::{AdapterEvent, AdapterEvents, ListenerId};
pub use link::{RegisterLink, TcpRegisterLink};
pub use manager::AdapterManager;
pub use messages::{DeviceStatus, StatusMessage, TelemetryMessage, PROTOCOL_SUNSPEC};
pub use model::{model_by_id, DataBlock, ModelDef, PointDef, PointKind, PointValue, MODELS};
pub use sunspec::{AdapterState, SunSpecAdapter};
pub use synth::MockDevice;
