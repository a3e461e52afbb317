//! Prometheus metrics for the Kafka edge proxy.
//!
//! Collected in an injected `ProxyMetrics` value rather than a process-wide
//! registry so tests can assert on counters in isolation.

use kafka_protocol::messages::ApiKey;
use prometheus::{Counter, CounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Proxy metrics collection.
pub struct ProxyMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Total connections accepted, by broker address.
    pub connections_total: CounterVec,

    /// Current number of proxied connections.
    pub active_connections: IntGauge,

    /// Total requests forwarded, by API key.
    pub requests_total: CounterVec,

    /// Total bytes forwarded from clients to brokers.
    pub bytes_client_to_broker: Counter,

    /// Total bytes forwarded from brokers to clients.
    pub bytes_broker_to_client: Counter,

    /// Authentication failures, by handshake stage.
    pub auth_failures_total: CounterVec,

    /// Requests rejected because their API key is forbidden.
    pub forbidden_requests_total: Counter,

    /// Connections torn down by an error, by error kind.
    pub connection_errors_total: CounterVec,
}

impl ProxyMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique
    /// names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = CounterVec::new(
            Opts::new(
                "kafka_edge_proxy_connections_total",
                "Total client connections accepted, by broker address",
            ),
            &["broker"],
        )
        .expect("metric creation should succeed");

        let active_connections = IntGauge::new(
            "kafka_edge_proxy_active_connections",
            "Current number of proxied connections",
        )
        .expect("metric creation should succeed");

        let requests_total = CounterVec::new(
            Opts::new(
                "kafka_edge_proxy_requests_total",
                "Total requests forwarded, by API key",
            ),
            &["api_key"],
        )
        .expect("metric creation should succeed");

        let bytes_client_to_broker = Counter::new(
            "kafka_edge_proxy_bytes_client_to_broker_total",
            "Total bytes forwarded from clients to brokers",
        )
        .expect("metric creation should succeed");

        let bytes_broker_to_client = Counter::new(
            "kafka_edge_proxy_bytes_broker_to_client_total",
            "Total bytes forwarded from brokers to clients",
        )
        .expect("metric creation should succeed");

        let auth_failures_total = CounterVec::new(
            Opts::new(
                "kafka_edge_proxy_auth_failures_total",
                "Authentication failures, by handshake stage",
            ),
            &["stage"],
        )
        .expect("metric creation should succeed");

        let forbidden_requests_total = Counter::new(
            "kafka_edge_proxy_forbidden_requests_total",
            "Requests rejected because their API key is forbidden",
        )
        .expect("metric creation should succeed");

        let connection_errors_total = CounterVec::new(
            Opts::new(
                "kafka_edge_proxy_connection_errors_total",
                "Connections torn down by an error, by error kind",
            ),
            &["kind"],
        )
        .expect("metric creation should succeed");

        for collector in [
            Box::new(connections_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(active_connections.clone()),
            Box::new(requests_total.clone()),
            Box::new(bytes_client_to_broker.clone()),
            Box::new(bytes_broker_to_client.clone()),
            Box::new(auth_failures_total.clone()),
            Box::new(forbidden_requests_total.clone()),
            Box::new(connection_errors_total.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration should succeed");
        }

        Self {
            registry,
            connections_total,
            active_connections,
            requests_total,
            bytes_client_to_broker,
            bytes_broker_to_client,
            auth_failures_total,
            forbidden_requests_total,
            connection_errors_total,
        }
    }

    /// Record an accepted connection.
    pub fn record_connection(&self, broker: &str) {
        self.connections_total.with_label_values(&[broker]).inc();
        self.active_connections.inc();
    }

    /// Record a finished connection.
    pub fn record_disconnect(&self) {
        self.active_connections.dec();
    }

    /// Record a forwarded request.
    pub fn record_request(&self, api_key: i16) {
        self.requests_total
            .with_label_values(&[&api_key_label(api_key)])
            .inc();
    }

    /// Record bytes forwarded toward the broker.
    pub fn record_bytes_client_to_broker(&self, bytes: u64) {
        self.bytes_client_to_broker.inc_by(bytes as f64);
    }

    /// Record bytes forwarded toward the client.
    pub fn record_bytes_broker_to_client(&self, bytes: u64) {
        self.bytes_broker_to_client.inc_by(bytes as f64);
    }

    /// Record an authentication failure for one handshake stage.
    pub fn record_auth_failure(&self, stage: &str) {
        self.auth_failures_total.with_label_values(&[stage]).inc();
    }

    /// Record a forbidden request.
    pub fn record_forbidden_request(&self) {
        self.forbidden_requests_total.inc();
    }

    /// Record a connection torn down by an error.
    pub fn record_connection_error(&self, kind: &str) {
        self.connection_errors_total.with_label_values(&[kind]).inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable label for an API key; unknown keys keep their number.
fn api_key_label(api_key: i16) -> String {
    match ApiKey::try_from(api_key) {
        Ok(key) => format!("{key:?}"),
        Err(_) => api_key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lifecycle() {
        let metrics = ProxyMetrics::new();
        metrics.record_connection("kafka-1:9092");
        metrics.record_connection("kafka-1:9092");
        assert_eq!(metrics.active_connections.get(), 2);

        metrics.record_disconnect();
        assert_eq!(metrics.active_connections.get(), 1);
        assert_eq!(
            metrics
                .connections_total
                .with_label_values(&["kafka-1:9092"])
                .get(),
            2.0
        );
    }

    #[test]
    fn test_api_key_label() {
        assert_eq!(api_key_label(3), "Metadata");
        assert_eq!(api_key_label(18), "ApiVersions");
        assert_eq!(api_key_label(9999), "9999");
    }

    #[test]
    fn test_encode_contains_metrics() {
        let metrics = ProxyMetrics::new();
        metrics.record_request(18);
        let text = metrics.encode().unwrap();
        assert!(text.contains("kafka_edge_proxy_requests_total"));
    }
}
