//! Prometheus Metrics
//!
//! Observability counters for the broker, exposed on the HTTP listener.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Broker metrics.
#[derive(Clone)]
pub struct BrokerMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections admitted.
    pub connections_total: IntCounter,
    /// Current live WebSocket connections.
    pub connections_active: IntGauge,
    /// Admission failures (unknown key, origin, capacity) and handshake errors.
    pub connection_errors: IntCounter,

    // Message metrics
    /// Total client frames received.
    pub messages_received: IntCounter,
    /// Total frames queued to clients.
    pub messages_sent: IntCounter,
    /// Frames dropped for being malformed or oversized.
    pub messages_rejected: IntCounter,

    // Channel metrics
    /// Total channel broadcasts performed.
    pub broadcasts_total: IntCounter,

    // Dispatch metrics
    /// Total dispatches scheduled.
    pub dispatches_total: IntCounter,
    /// Dispatches that ended in a handler error.
    pub dispatch_errors: IntCounter,
    /// Dispatches that hit the terminal-envelope timeout.
    pub dispatch_timeouts: IntCounter,

    // Control socket metrics
    /// Requests received on the local broadcast socket.
    pub control_requests: IntCounter,
    /// Malformed or failed control socket requests.
    pub control_errors: IntCounter,
}

impl BrokerMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "crest_connections_total",
            "Total WebSocket connections admitted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "crest_connections_active",
            "Current live WebSocket connections",
        ))
        .unwrap();

        let connection_errors = IntCounter::with_opts(Opts::new(
            "crest_connection_errors_total",
            "Total admission and handshake failures",
        ))
        .unwrap();

        let messages_received = IntCounter::with_opts(Opts::new(
            "crest_messages_received_total",
            "Total client frames received",
        ))
        .unwrap();

        let messages_sent = IntCounter::with_opts(Opts::new(
            "crest_messages_sent_total",
            "Total frames queued to clients",
        ))
        .unwrap();

        let messages_rejected = IntCounter::with_opts(Opts::new(
            "crest_messages_rejected_total",
            "Total frames dropped as malformed or oversized",
        ))
        .unwrap();

        let broadcasts_total = IntCounter::with_opts(Opts::new(
            "crest_broadcasts_total",
            "Total channel broadcasts performed",
        ))
        .unwrap();

        let dispatches_total = IntCounter::with_opts(Opts::new(
            "crest_dispatches_total",
            "Total event dispatches scheduled",
        ))
        .unwrap();

        let dispatch_errors = IntCounter::with_opts(Opts::new(
            "crest_dispatch_errors_total",
            "Total dispatches that ended in a handler error",
        ))
        .unwrap();

        let dispatch_timeouts = IntCounter::with_opts(Opts::new(
            "crest_dispatch_timeouts_total",
            "Total dispatches that hit the reply timeout",
        ))
        .unwrap();

        let control_requests = IntCounter::with_opts(Opts::new(
            "crest_control_requests_total",
            "Total requests on the local broadcast socket",
        ))
        .unwrap();

        let control_errors = IntCounter::with_opts(Opts::new(
            "crest_control_errors_total",
            "Total failed control socket requests",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry.register(Box::new(messages_sent.clone())).unwrap();
        registry
            .register(Box::new(messages_rejected.clone()))
            .unwrap();
        registry
            .register(Box::new(broadcasts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(dispatches_total.clone()))
            .unwrap();
        registry
            .register(Box::new(dispatch_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(dispatch_timeouts.clone()))
            .unwrap();
        registry
            .register(Box::new(control_requests.clone()))
            .unwrap();
        registry
            .register(Box::new(control_errors.clone()))
            .unwrap();

        BrokerMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            messages_received,
            messages_sent,
            messages_rejected,
            broadcasts_total,
            dispatches_total,
            dispatch_errors,
            dispatch_timeouts,
            control_requests,
            control_errors,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_contains_registered_counters() {
        let metrics = BrokerMetrics::new();
        metrics.connections_total.inc();
        metrics.dispatches_total.inc_by(3);

        let text = metrics.encode();
        assert!(text.contains("crest_connections_total 1"));
        assert!(text.contains("crest_dispatches_total 3"));
    }
}
