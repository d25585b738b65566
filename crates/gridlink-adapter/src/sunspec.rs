//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "SunSpec adapter state machine and scan scheduler."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The SunSpec adapter.
//!
//! One adapter owns one device: its register link, its scan schedule, and
//! the telemetry and status envelopes it puts on the bus. All lifecycle
//! operations are idempotent so callers can retry without bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gridlink_bus::BusClient;
use gridlink_common::config::{ConnectionType, DeviceConfig};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::events::{AdapterEvent, AdapterEvents};
use crate::link::{RegisterLink, TcpRegisterLink};
use crate::messages::{DeviceStatus, StatusMessage, TelemetryMessage};
use crate::model::{model_by_id, DataBlock};
use crate::synth::MockDevice;
use crate::{AdapterError, Result};

/// Base address of the SunSpec register map.
const SUNSPEC_BASE: u16 = 40000;
/// "Su" "nS" marker words expected at the base address.
const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6E53];
/// First register of the model chain, after the marker.
const CHAIN_START: u16 = 40002;
/// End-of-chain model id.
const CHAIN_END: u16 = 0xFFFF;
/// Sanity cap on chain walking.
const CHAIN_MAX_MODELS: usize = 64;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle state of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// No connection.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected, no scan schedule running.
    Connected,
    /// Connected with the scan schedule running.
    Scanning,
    /// A scan failure was recorded; the schedule keeps running and the
    /// adapter returns to [`AdapterState::Scanning`] on the next success.
    Error,
}

/// One entry of the device's discovered model chain.
#[derive(Debug, Clone, Copy)]
struct ChainEntry {
    model_id: u16,
    /// First register of the model's data section.
    address: u16,
    /// Data-section length the device declared in the chain header.
    length: u16,
}

/// Adapter for one SunSpec device.
pub struct SunSpecAdapter {
    config: DeviceConfig,
    bus: Arc<BusClient>,
    events: AdapterEvents,
    link: Option<Arc<dyn RegisterLink>>,
    mock: Mutex<MockDevice>,
    state: Mutex<AdapterState>,
    chain: Mutex<Vec<ChainEntry>>,
    last_error: Mutex<Option<String>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    scan_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SunSpecAdapter {
    /// Create an adapter for `config`. No connection is made yet.
    pub fn new(config: DeviceConfig, bus: Arc<BusClient>, events: AdapterEvents) -> Self {
        let link: Option<Arc<dyn RegisterLink>> = if config.mock_mode {
            None
        } else {
            match (&config.connection_type, &config.host) {
                (ConnectionType::Tcp, Some(host)) => Some(Arc::new(TcpRegisterLink::new(
                    host.clone(),
                    config.port,
                    1,
                    config.timeout(),
                ))),
                _ => None,
            }
        };
        Self::with_link(config, bus, events, link)
    }

    /// Create an adapter over an explicit register link. Used by tests and
    /// by callers with custom transports.
    pub fn with_link(
        config: DeviceConfig,
        bus: Arc<BusClient>,
        events: AdapterEvents,
        link: Option<Arc<dyn RegisterLink>>,
    ) -> Self {
        let mock = MockDevice::new(config.id);
        Self {
            config,
            bus,
            events,
            link,
            mock: Mutex::new(mock),
            state: Mutex::new(AdapterState::Disconnected),
            chain: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            stop: Mutex::new(None),
            scan_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Numeric device identifier.
    pub fn device_id(&self) -> u32 {
        self.config.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Description of the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
    }

    fn record_error(&self, err: &AdapterError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    async fn publish_status(&self, status: DeviceStatus, details: Option<String>) {
        let message = StatusMessage::now(self.config.id, status, details);
        if !self.bus.publish(message.to_outbound()).await {
            debug!(device_id = self.config.id, ?status, "status publish dropped");
        }
        self.events.emit(&AdapterEvent::StatusChanged {
            device_id: self.config.id,
            status,
        });
    }

    /// Establish the device connection. Idempotent: connecting while
    /// connected or scanning is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if matches!(
            self.state(),
            AdapterState::Connected | AdapterState::Scanning | AdapterState::Error
        ) {
            return Ok(());
        }
        self.set_state(AdapterState::Connecting);

        let result = if self.config.mock_mode {
            Ok(())
        } else {
            self.connect_real().await
        };
        match result {
            Ok(()) => {
                self.set_state(AdapterState::Connected);
                info!(device_id = self.config.id, mock = self.config.mock_mode, "device connected");
                self.publish_status(DeviceStatus::Online, None).await;
                self.events.emit(&AdapterEvent::Connected {
                    device_id: self.config.id,
                });
                Ok(())
            }
            Err(err) => {
                self.record_error(&err);
                self.set_state(AdapterState::Disconnected);
                warn!(device_id = self.config.id, error = %err, "device connect failed");
                self.publish_status(DeviceStatus::Error, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    async fn connect_real(&self) -> Result<()> {
        let link = match &self.link {
            Some(link) => Arc::clone(link),
            None => {
                return Err(match self.config.connection_type {
                    ConnectionType::Rtu => AdapterError::Unsupported("rtu register links"),
                    ConnectionType::Tcp => {
                        AdapterError::Protocol("tcp device without a host".to_owned())
                    }
                })
            }
        };

        let mut delay = CONNECT_RETRY_DELAY;
        let mut opened = false;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match link.open().await {
                Ok(()) => {
                    opened = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        device_id = self.config.id,
                        attempt,
                        error = %err,
                        "register link open failed"
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        if !opened {
            return Err(AdapterError::ConnectExhausted(self.config.id));
        }

        let marker = link.read_registers(SUNSPEC_BASE, 2).await?;
        if marker.as_slice() != &SUNSPEC_MARKER[..] {
            let _ = link.close().await;
            return Err(AdapterError::NotSunSpec);
        }

        let chain = discover_chain(link.as_ref()).await?;
        debug!(
            device_id = self.config.id,
            models = chain.len(),
            "model chain discovered"
        );
        *self.chain.lock() = chain;
        Ok(())
    }

    /// Tear the connection down, stopping the scan schedule first.
    /// Idempotent: disconnecting while disconnected is a no-op.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        if matches!(self.state(), AdapterState::Disconnected) {
            return Ok(());
        }
        self.stop_scanning();
        if let Some(handle) = self.scan_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(link) = &self.link {
            link.close().await?;
        }
        self.chain.lock().clear();
        self.set_state(AdapterState::Disconnected);
        info!(device_id = self.config.id, "device disconnected");
        self.publish_status(DeviceStatus::Offline, None).await;
        self.events.emit(&AdapterEvent::Disconnected {
            device_id: self.config.id,
        });
        Ok(())
    }

    /// Start the scan schedule, connecting first if needed. The first scan
    /// runs immediately; subsequent scans follow the configured interval
    /// and never overlap. Idempotent while scanning.
    pub async fn start_scanning(self: &Arc<Self>) -> Result<()> {
        // the stop slot doubles as the schedule claim; taking it before the
        // connect await keeps a concurrent caller from spawning a second loop
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut stop = self.stop.lock();
            if stop.is_some() {
                return Ok(());
            }
            *stop = Some(stop_tx);
        }
        if let Err(err) = self.connect().await {
            *self.stop.lock() = None;
            return Err(err);
        }
        self.set_state(AdapterState::Scanning);

        let adapter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(adapter.config.scan_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut healthy = true;
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match adapter.scan_once().await {
                            Ok(()) => {
                                if !healthy {
                                    healthy = true;
                                    adapter.set_state(AdapterState::Scanning);
                                    adapter.publish_status(DeviceStatus::Online, None).await;
                                }
                            }
                            Err(err) => {
                                warn!(
                                    device_id = adapter.config.id,
                                    error = %err,
                                    "scan cycle failed"
                                );
                                adapter.record_error(&err);
                                if healthy {
                                    healthy = false;
                                    adapter.set_state(AdapterState::Error);
                                    adapter
                                        .publish_status(
                                            DeviceStatus::Error,
                                            Some(err.to_string()),
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                }
            }
            debug!(device_id = adapter.config.id, "scan schedule stopped");
        });
        *self.scan_task.lock().await = Some(handle);
        info!(
            device_id = self.config.id,
            interval_ms = self.config.scan_interval().as_millis() as u64,
            "scan schedule started"
        );
        Ok(())
    }

    /// Signal the scan schedule to stop. Returns without waiting for an
    /// in-flight cycle to finish. Idempotent while not scanning.
    pub fn stop_scanning(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(true);
        }
        let mut state = self.state.lock();
        if matches!(*state, AdapterState::Scanning | AdapterState::Error) {
            *state = AdapterState::Connected;
        }
    }

    /// Run one scan cycle: read every configured model, decode, publish a
    /// single telemetry envelope. Any model failure aborts the cycle before
    /// anything is published.
    async fn scan_once(&self) -> Result<()> {
        let timestamp = Utc::now();
        let mut blocks = Vec::with_capacity(self.config.models.len());
        for &model_id in &self.config.models {
            let model = model_by_id(model_id).ok_or(AdapterError::UnknownModel(model_id))?;
            let block = if self.config.mock_mode {
                self.mock.lock().sample_block(model)
            } else {
                let entry = self
                    .chain
                    .lock()
                    .iter()
                    .find(|entry| entry.model_id == model_id)
                    .copied()
                    .ok_or(AdapterError::ModelNotPresent(model_id))?;
                if entry.length < model.register_count() {
                    return Err(AdapterError::Protocol(format!(
                        "model {model_id} declares {} registers, schema needs {}",
                        entry.length,
                        model.register_count()
                    )));
                }
                let link = self.link.as_ref().ok_or(AdapterError::LinkClosed)?;
                let regs = link
                    .read_registers(entry.address, model.register_count())
                    .await?;
                DataBlock::decode(model, &regs)?
            };
            blocks.push(block);
        }

        let message = TelemetryMessage::from_blocks(self.config.id, timestamp, &blocks);
        if !self.bus.publish(message.to_outbound()).await {
            warn!(device_id = self.config.id, "telemetry publish dropped");
        }
        self.events.emit(&AdapterEvent::Telemetry(message));
        Ok(())
    }
}

/// Walk the model chain starting after the marker, collecting id, data
/// address, and declared length for each model until the end sentinel.
async fn discover_chain(link: &dyn RegisterLink) -> Result<Vec<ChainEntry>> {
    let mut chain = Vec::new();
    let mut cursor = CHAIN_START;
    loop {
        let header = link.read_registers(cursor, 2).await?;
        let model_id = header[0];
        if model_id == CHAIN_END {
            break;
        }
        let length = header[1];
        chain.push(ChainEntry {
            model_id,
            address: cursor + 2,
            length,
        });
        if chain.len() >= CHAIN_MAX_MODELS {
            return Err(AdapterError::Protocol(
                "model chain exceeds sanity cap".to_owned(),
            ));
        }
        cursor = cursor
            .checked_add(2 + length)
            .ok_or_else(|| AdapterError::Protocol("model chain overruns address space".to_owned()))?;
    }
    Ok(chain)
}
