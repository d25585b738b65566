//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process event fan-out for adapter lifecycle changes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-process adapter events.
//!
//! The bus carries envelopes for other services; this registry lets code in
//! the same process (the daemon, tests) observe adapter activity without a
//! broker round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::messages::{DeviceStatus, TelemetryMessage};

/// Something an adapter did.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Physical or mock connection established.
    Connected {
        /// Device the event concerns.
        device_id: u32,
    },
    /// Connection torn down.
    Disconnected {
        /// Device the event concerns.
        device_id: u32,
    },
    /// Reported lifecycle state changed.
    StatusChanged {
        /// Device the event concerns.
        device_id: u32,
        /// New state.
        status: DeviceStatus,
    },
    /// A scan cycle completed and produced readings.
    Telemetry(TelemetryMessage),
}

/// Opaque handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&AdapterEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Listener,
}

/// Listener registry, cloneable and shareable across tasks.
#[derive(Clone, Default)]
pub struct AdapterEvents {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<ListenerEntry>>,
}

impl AdapterEvents {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. A failing listener is logged and skipped; it
    /// never blocks delivery to the others.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AdapterEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push(ListenerEntry {
            id,
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener. Unknown ids are a no-op.
    pub fn remove(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|entry| entry.id != id);
    }

    /// Deliver an event to every registered listener.
    pub fn emit(&self, event: &AdapterEvent) {
        // snapshot so a listener may re-register without deadlocking
        let entries: Vec<ListenerEntry> = self.inner.listeners.lock().clone();
        for entry in entries {
            if let Err(err) = (entry.listener)(event) {
                warn!(listener = entry.id.0, error = %err, "adapter listener failed");
            }
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
