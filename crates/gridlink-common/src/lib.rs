//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Shared building blocks for the GridLink telemetry core: configuration
//! loading and the tracing bootstrap used by every binary and test harness.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BrokerKind, BusConfig, ConnectionType, DeviceConfig, LoadedAppConfig,
    LoggingConfig, Mode, ReconnectConfig,
};
pub use logging::{init_tracing, LogFormat};
