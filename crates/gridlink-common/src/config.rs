//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_broker_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "gridlink-core".to_owned()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_multiplier() -> f64 {
    1.5
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_modbus_port() -> u16 {
    502
}

fn default_device_timeout_ms() -> u64 {
    10_000
}

fn default_scan_interval_ms() -> u64 {
    5_000
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Runtime mode controlling how the adapter manager treats new devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Real deployment; devices are connected only on explicit request.
    Production,
    /// Engineering bring-up; devices auto-connect and start scanning.
    Development,
    /// Fully simulated fleet; every device runs in mock mode.
    Simulation,
}

impl Mode {
    /// Whether devices registered with the manager should connect and start
    /// scanning without an explicit external trigger.
    pub fn auto_start(self) -> bool {
        !matches!(self, Mode::Production)
    }

    /// Whether the runtime forces mock transports regardless of device
    /// configuration.
    pub fn is_simulation(self) -> bool {
        matches!(self, Mode::Simulation)
    }
}

/// Primary configuration object for the telemetry core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Runtime mode.
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Message bus connectivity.
    #[serde(default)]
    pub bus: BusConfig,
    /// Logging sink configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Devices to register with the adapter manager at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    /// The parsed configuration.
    pub config: AppConfig,
    /// Path the configuration was read from.
    pub source: PathBuf,
}

impl AppConfig {
    /// Environment variable overriding the configuration search path.
    pub const ENV_CONFIG_PATH: &'static str = "GRIDLINK_CONFIG";

    /// Load configuration from disk, respecting the `GRIDLINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a configuration file from an explicit path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("unable to read configuration {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("unable to parse configuration {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), devices = config.devices.len(), "configuration loaded");
        Ok(config)
    }

    /// Reject configurations the runtime cannot act on.
    pub fn validate(&self) -> Result<()> {
        let mut seen = indexmap::IndexSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(anyhow!("duplicate device id {} in configuration", device.id));
            }
            device.validate()?;
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            bus: BusConfig::default(),
            logging: LoggingConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// Broker backends understood by the composition root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-memory broker, used in non-production contexts and tests.
    Mock,
    /// External MQTT broker.
    Mqtt,
}

/// Message bus connectivity and reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Broker backend to attach to.
    pub broker: BrokerKind,
    /// Broker host (MQTT only).
    #[serde(default = "default_broker_host")]
    pub host: String,
    /// Broker port (MQTT only).
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Reconnect backoff policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Mock,
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Exponential backoff policy applied after an unclean transport close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_reconnect_multiplier")]
    pub multiplier: f64,
    /// Ceiling on the delay between attempts, in milliseconds.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts before the client parks disconnected.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            multiplier: default_reconnect_multiplier(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    /// Delay for the given attempt number (1-based), capped at the ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent as i32);
        Duration::from_millis((raw as u64).min(self.max_delay_ms))
    }
}

/// Physical link family for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Modbus TCP over an IP network.
    Tcp,
    /// Modbus RTU over a serial line.
    Rtu,
}

/// Per-device record consumed from the external configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Numeric device identifier, unique within the fleet.
    pub id: u32,
    /// Physical link family.
    pub connection_type: ConnectionType,
    /// Host for TCP links.
    #[serde(default)]
    pub host: Option<String>,
    /// Port for TCP links.
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Serial device path for RTU links.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Baud rate for RTU links.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Connection/read timeout in milliseconds.
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
    /// Synthesize readings instead of touching real hardware.
    #[serde(default)]
    pub mock_mode: bool,
    /// SunSpec model identifiers the device exposes.
    pub models: Vec<u16>,
    /// Interval between scan cycles in milliseconds.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl DeviceConfig {
    /// Connection/read timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Scan cadence as a [`Duration`].
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(anyhow!("device {} declares no models", self.id));
        }
        if self.scan_interval_ms == 0 {
            return Err(anyhow!("device {} has a zero scan interval", self.id));
        }
        if !self.mock_mode {
            match self.connection_type {
                ConnectionType::Tcp if self.host.is_none() => {
                    return Err(anyhow!("tcp device {} is missing a host", self.id));
                }
                ConnectionType::Rtu if self.path.is_none() => {
                    return Err(anyhow!("rtu device {} is missing a serial path", self.id));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Logging sink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files.
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// Optional file name prefix; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Stdout format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            file_prefix: None,
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode: development
bus:
  broker: mock
devices:
  - id: 42
    connection_type: tcp
    host: 10.0.0.7
    mock_mode: false
    models: [1, 103]
    scan_interval_ms: 1000
  - id: 43
    connection_type: tcp
    mock_mode: true
    models: [1, 802]
"#;

    #[test]
    fn sample_configuration_parses_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).expect("parse sample");
        config.validate().expect("sample is valid");
        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].port, 502);
        assert_eq!(config.devices[0].timeout_ms, 10_000);
        assert_eq!(config.devices[1].scan_interval_ms, 5_000);
        assert!(config.devices[1].mock_mode);
    }

    #[test]
    fn duplicate_device_ids_are_rejected() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).expect("parse sample");
        config.devices[1].id = 42;
        assert!(config.validate().is_err());
    }

    #[test]
    fn real_tcp_device_requires_host() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).expect("parse sample");
        config.devices[0].host = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_delays_grow_and_saturate() {
        let policy = ReconnectConfig {
            base_delay_ms: 100,
            multiplier: 1.5,
            max_delay_ms: 300,
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(150));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(225));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn load_honours_environment_override() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), SAMPLE).expect("write sample");
        std::env::set_var(AppConfig::ENV_CONFIG_PATH, file.path());
        let loaded =
            AppConfig::load_with_source(&["/nonexistent/gridlink.yaml"]).expect("env load");
        std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
        assert_eq!(loaded.source, file.path());
        assert_eq!(loaded.config.devices.len(), 2);
    }
}
