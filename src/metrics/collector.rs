//! Metrics collector using prometheus-client.
//!
//! Provides metrics for sessions, relayed bytes, dial failures and
//! forwarded HTTP requests.

use crate::config::Protocol;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-protocol session metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    pub protocol: String,
}

/// Labels for bytes transferred metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub protocol: String,
    pub direction: Direction,
}

/// Direction of bytes transfer.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    /// Client to destination.
    Upstream,
    /// Destination to client.
    Downstream,
}

/// Labels for forwarded HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total sessions accepted.
    sessions_total: Family<SessionLabels, Counter>,
    /// Sessions currently open.
    active_sessions: Family<SessionLabels, Gauge>,
    /// Session duration histogram (in seconds).
    session_duration_seconds: Family<SessionLabels, Histogram>,
    /// Bytes relayed.
    bytes_total: Family<BytesLabels, Counter>,
    /// Destinations that could not be reached.
    dial_failures_total: Family<SessionLabels, Counter>,
    /// Malformed client handshakes or requests.
    protocol_errors_total: Family<SessionLabels, Counter>,
    /// Absolute-URI requests forwarded by the HTTP front-end.
    http_requests_total: Family<RequestLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sessions_total = Family::<SessionLabels, Counter>::default();
        let active_sessions = Family::<SessionLabels, Gauge>::default();
        let session_duration_seconds =
            Family::<SessionLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 10ms up to roughly 45 minutes
                Histogram::new(exponential_buckets(0.01, 3.0, 13))
            });
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let dial_failures_total = Family::<SessionLabels, Counter>::default();
        let protocol_errors_total = Family::<SessionLabels, Counter>::default();
        let http_requests_total = Family::<RequestLabels, Counter>::default();

        registry.register(
            "dualproxy_sessions",
            "Total number of client sessions accepted",
            sessions_total.clone(),
        );
        registry.register(
            "dualproxy_active_sessions",
            "Number of sessions currently open",
            active_sessions.clone(),
        );
        registry.register(
            "dualproxy_session_duration_seconds",
            "Session duration in seconds",
            session_duration_seconds.clone(),
        );
        registry.register(
            "dualproxy_bytes",
            "Total bytes relayed",
            bytes_total.clone(),
        );
        registry.register(
            "dualproxy_dial_failures",
            "Total number of failed destination dials",
            dial_failures_total.clone(),
        );
        registry.register(
            "dualproxy_protocol_errors",
            "Total number of malformed client handshakes",
            protocol_errors_total.clone(),
        );
        registry.register(
            "dualproxy_http_requests",
            "Total number of forwarded HTTP requests",
            http_requests_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                sessions_total,
                active_sessions,
                session_duration_seconds,
                bytes_total,
                dial_failures_total,
                protocol_errors_total,
                http_requests_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// A session was accepted.
    pub fn session_opened(&self, protocol: Protocol) {
        let labels = session_labels(protocol);
        self.inner.sessions_total.get_or_create(&labels).inc();
        self.inner.active_sessions.get_or_create(&labels).inc();
    }

    /// A session ended.
    pub fn session_closed(&self, protocol: Protocol, duration: Duration) {
        let labels = session_labels(protocol);
        self.inner.active_sessions.get_or_create(&labels).dec();
        self.inner
            .session_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
    }

    /// Record bytes relayed by a finished session.
    pub fn record_relay(&self, protocol: Protocol, bytes_to_destination: u64, bytes_to_client: u64) {
        let upstream = BytesLabels {
            protocol: protocol.as_str().to_string(),
            direction: Direction::Upstream,
        };
        self.inner
            .bytes_total
            .get_or_create(&upstream)
            .inc_by(bytes_to_destination);

        let downstream = BytesLabels {
            protocol: protocol.as_str().to_string(),
            direction: Direction::Downstream,
        };
        self.inner
            .bytes_total
            .get_or_create(&downstream)
            .inc_by(bytes_to_client);
    }

    pub fn dial_failed(&self, protocol: Protocol) {
        self.inner
            .dial_failures_total
            .get_or_create(&session_labels(protocol))
            .inc();
    }

    pub fn protocol_error(&self, protocol: Protocol) {
        self.inner
            .protocol_errors_total
            .get_or_create(&session_labels(protocol))
            .inc();
    }

    /// Record a forwarded absolute-URI request.
    pub fn record_http_request(&self, method: &str, status: u16) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.http_requests_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn session_labels(protocol: Protocol) -> SessionLabels {
    SessionLabels {
        protocol: protocol.as_str().to_string(),
    }
}
