//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet registry and adapter lifecycle orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The adapter manager.
//!
//! One manager owns the fleet: it builds adapters from device configs,
//! decides when they start based on the runtime mode, and tears everything
//! down on shutdown. In simulation mode every device is forced to mock so
//! a bench config can never reach real hardware.

use std::collections::HashMap;
use std::sync::Arc;

use gridlink_bus::BusClient;
use gridlink_common::config::{DeviceConfig, Mode};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::events::{AdapterEvent, AdapterEvents};
use crate::sunspec::SunSpecAdapter;
use crate::{AdapterError, Result};

/// Registry and lifecycle orchestrator for the device fleet.
pub struct AdapterManager {
    mode: Mode,
    bus: Arc<BusClient>,
    events: AdapterEvents,
    devices: Mutex<HashMap<u32, Arc<SunSpecAdapter>>>,
}

impl AdapterManager {
    /// Create an empty manager for the given runtime mode.
    pub fn new(mode: Mode, bus: Arc<BusClient>) -> Self {
        let events = AdapterEvents::new();
        events.on(|event| {
            match event {
                AdapterEvent::Connected { device_id } => {
                    debug!(device_id, "adapter connected");
                }
                AdapterEvent::Disconnected { device_id } => {
                    debug!(device_id, "adapter disconnected");
                }
                AdapterEvent::StatusChanged { device_id, status } => {
                    debug!(device_id, ?status, "adapter status changed");
                }
                AdapterEvent::Telemetry(message) => {
                    debug!(device_id = message.device_id, "telemetry cycle published");
                }
            }
            Ok(())
        });
        Self {
            mode,
            bus,
            events,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Shared event registry. Listeners registered here observe every
    /// adapter the manager owns.
    pub fn events(&self) -> &AdapterEvents {
        &self.events
    }

    /// Register a device and, outside production mode, bring it online and
    /// start its scan schedule. Startup failures are reported on the bus as
    /// error status and logged; they do not fail registration. Adding an
    /// already-registered id returns the existing adapter untouched.
    pub async fn add_device(&self, mut config: DeviceConfig) -> Result<Arc<SunSpecAdapter>> {
        if self.mode.is_simulation() && !config.mock_mode {
            debug!(device_id = config.id, "simulation mode forces mock");
            config.mock_mode = true;
        }

        let (adapter, created) = {
            let mut devices = self.devices.lock();
            if let Some(existing) = devices.get(&config.id) {
                (Arc::clone(existing), false)
            } else {
                let adapter = Arc::new(SunSpecAdapter::new(
                    config.clone(),
                    Arc::clone(&self.bus),
                    self.events.clone(),
                ));
                devices.insert(config.id, Arc::clone(&adapter));
                (adapter, true)
            }
        };
        if !created {
            return Ok(adapter);
        }
        info!(device_id = config.id, mock = config.mock_mode, "device registered");

        if self.mode.auto_start() || config.mock_mode {
            if let Err(err) = adapter.start_scanning().await {
                warn!(device_id = config.id, error = %err, "device startup failed");
            }
        }
        Ok(adapter)
    }

    /// Explicitly bring one device online and start scanning. This is the
    /// production-mode trigger; the other modes start devices on add.
    pub async fn start_device(&self, device_id: u32) -> Result<()> {
        let adapter = self
            .device(device_id)
            .ok_or(AdapterError::UnknownDevice(device_id))?;
        adapter.start_scanning().await
    }

    /// Disconnect and forget a device. Removing an unknown id is a no-op.
    pub async fn remove_device(&self, device_id: u32) -> Result<()> {
        let adapter = self.devices.lock().remove(&device_id);
        match adapter {
            Some(adapter) => {
                adapter.disconnect().await?;
                info!(device_id, "device removed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Disconnect every device and empty the registry. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        let adapters: Vec<Arc<SunSpecAdapter>> =
            self.devices.lock().drain().map(|(_, a)| a).collect();
        if adapters.is_empty() {
            return;
        }
        info!(devices = adapters.len(), "shutting down adapters");
        let disconnects = adapters.iter().map(|adapter| adapter.disconnect());
        for result in futures::future::join_all(disconnects).await {
            if let Err(err) = result {
                warn!(error = %err, "adapter disconnect during shutdown failed");
            }
        }
    }

    /// Look up one adapter.
    pub fn device(&self, device_id: u32) -> Option<Arc<SunSpecAdapter>> {
        self.devices.lock().get(&device_id).cloned()
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}
