//! ---
//! ems_section: "02-message-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Topic-matched publish/subscribe bus and transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use prometheus::{IntCounter, Opts, Registry};

/// Prometheus metric handles for bus activity.
pub struct BusMetricsExporter {
    published: IntCounter,
    delivered: IntCounter,
    dropped: IntCounter,
    handler_failures: IntCounter,
}

impl BusMetricsExporter {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "bus_messages_published_total",
            "Messages handed to the broker transport",
        ))?;
        let delivered = IntCounter::with_opts(Opts::new(
            "bus_messages_delivered_total",
            "Inbound messages delivered to at least one local handler",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "bus_messages_dropped_total",
            "Publishes refused or failed at the transport",
        ))?;
        let handler_failures = IntCounter::with_opts(Opts::new(
            "bus_handler_failures_total",
            "Subscriber handlers that returned an error",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(handler_failures.clone()))?;

        Ok(Self {
            published,
            delivered,
            dropped,
            handler_failures,
        })
    }

    /// Record a successful publish.
    pub fn observe_published(&self) {
        self.published.inc();
    }

    /// Record an inbound message delivered locally.
    pub fn observe_delivered(&self) {
        self.delivered.inc();
    }

    /// Record a dropped publish.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a handler error.
    pub fn observe_handler_failure(&self) {
        self.handler_failures.inc();
    }
}
