//! Prometheus metrics for the proxy.
//!
//! The registry is process-global; the admin API exposes it in text format.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    // Handshake metrics
    /// Authentication outcomes
    pub handshakes_total: IntCounterVec,
    /// Handshake latency in seconds
    pub handshake_duration_seconds: HistogramVec,

    // Traffic metrics
    /// Commands forwarded, by command name
    pub commands_total: IntCounterVec,
    /// Bytes received from clients / backends
    pub bytes_total: IntCounterVec,

    // Redirection metrics
    /// Redirect attempts by result
    pub redirects_total: IntCounterVec,

    // Backend metrics
    /// Backends by routing status
    pub backend_status: IntGaugeVec,
    /// Health probe results
    pub health_check_total: IntCounterVec,

    // Runtime metrics
    /// Panics caught at task boundaries
    pub task_panics_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "hermes_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "hermes_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "hermes_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let handshakes_total = IntCounterVec::new(
            Opts::new(
                "hermes_handshakes_total",
                "Total number of authentication attempts by result",
            ),
            &["result"], // ok, auth_fail, error
        )
        .unwrap();

        let handshake_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "hermes_handshake_duration_seconds",
                "Authentication latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["result"],
        )
        .unwrap();

        let commands_total = IntCounterVec::new(
            Opts::new("hermes_commands_total", "Total commands forwarded"),
            &["command"],
        )
        .unwrap();

        let bytes_total = IntCounterVec::new(
            Opts::new("hermes_bytes_total", "Bytes moved through the proxy"),
            &["direction"], // client_in, client_out, backend_in, backend_out
        )
        .unwrap();

        let redirects_total = IntCounterVec::new(
            Opts::new(
                "hermes_redirects_total",
                "Session redirect attempts by result",
            ),
            &["result"], // succeed, fail
        )
        .unwrap();

        let backend_status = IntGaugeVec::new(
            Opts::new(
                "hermes_backend_status",
                "Current number of backends by routing status",
            ),
            &["status"], // healthy, unhealthy, cannot_connect
        )
        .unwrap();

        let health_check_total = IntCounterVec::new(
            Opts::new(
                "hermes_health_check_total",
                "Total number of backend probes by result",
            ),
            &["result"], // success, failure, unreachable
        )
        .unwrap();

        let task_panics_total = IntCounter::new(
            "hermes_task_panics_total",
            "Panics caught at task boundaries",
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(handshakes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(handshake_duration_seconds.clone()))
            .unwrap();
        registry.register(Box::new(commands_total.clone())).unwrap();
        registry.register(Box::new(bytes_total.clone())).unwrap();
        registry
            .register(Box::new(redirects_total.clone()))
            .unwrap();
        registry.register(Box::new(backend_status.clone())).unwrap();
        registry
            .register(Box::new(health_check_total.clone()))
            .unwrap();
        registry
            .register(Box::new(task_panics_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            handshakes_total,
            handshake_duration_seconds,
            commands_total,
            bytes_total,
            redirects_total,
            backend_status,
            health_check_total,
            task_panics_total,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    pub fn record_handshake(&self, result: &str, duration_secs: f64) {
        self.handshakes_total.with_label_values(&[result]).inc();
        self.handshake_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }

    pub fn record_bytes(&self, direction: &str, count: u64) {
        self.bytes_total
            .with_label_values(&[direction])
            .inc_by(count);
    }

    pub fn record_redirect(&self, result: &str) {
        self.redirects_total.with_label_values(&[result]).inc();
    }

    pub fn set_backend_status(&self, healthy: i64, unhealthy: i64, cannot_connect: i64) {
        self.backend_status
            .with_label_values(&["healthy"])
            .set(healthy);
        self.backend_status
            .with_label_values(&["unhealthy"])
            .set(unhealthy);
        self.backend_status
            .with_label_values(&["cannot_connect"])
            .set(cannot_connect);
    }

    pub fn record_health_check(&self, result: &str) {
        self.health_check_total.with_label_values(&[result]).inc();
    }

    pub fn record_task_panic(&self) {
        self.task_panics_total.inc();
    }

    /// Render the registry in Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
