//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::Outcome;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "relay_requests_total";
    pub const REQUEST_SECONDS: &str = "relay_request_duration_seconds";
    pub const REQUEST_CONNECTIONS_ACTIVE: &str = "relay_request_connections_active";
    pub const SUBSCRIBERS_TOTAL: &str = "relay_subscribers_total";
    pub const SUBSCRIBERS_ACTIVE: &str = "relay_subscribers_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const TOPICS_ACTIVE: &str = "relay_topics_active";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::REQUESTS_TOTAL,
        "Requests handled, by reply service and outcome"
    );
    metrics::describe_histogram!(
        names::REQUEST_SECONDS,
        "Time spent in the dispatcher per request"
    );
    metrics::describe_gauge!(
        names::REQUEST_CONNECTIONS_ACTIVE,
        "Current number of request connections"
    );
    metrics::describe_counter!(
        names::SUBSCRIBERS_TOTAL,
        "Total number of subscriber connections since server start"
    );
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of subscriber connections"
    );
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Total number of topic subscriptions");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topics with subscribers");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Records delivered to subscriber connections"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Labels for a processed request: the reply service and the outcome.
#[must_use]
pub fn request_labels(outcome: &Outcome) -> (&'static str, &'static str) {
    match outcome {
        Outcome::Ok(service) => (service.as_str(), "ok"),
        Outcome::Undecodable => ("error", "undecodable"),
        Outcome::Failed(kind) => ("error", kind.as_str()),
    }
}

/// Record a processed request.
pub fn record_request(outcome: &Outcome, elapsed: Duration) {
    let (service, outcome) = request_labels(outcome);
    counter!(names::REQUESTS_TOTAL, "service" => service, "outcome" => outcome).increment(1);
    histogram!(names::REQUEST_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record a record delivered to a subscriber.
pub fn record_delivery() {
    counter!(names::DELIVERIES_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Request,
    Subscriber,
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    kind: ConnectionKind,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Request => {
                gauge!(names::REQUEST_CONNECTIONS_ACTIVE).increment(1.0);
            }
            ConnectionKind::Subscriber => {
                counter!(names::SUBSCRIBERS_TOTAL).increment(1);
                gauge!(names::SUBSCRIBERS_ACTIVE).increment(1.0);
            }
        }
        Self { kind }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        match self.kind {
            ConnectionKind::Request => gauge!(names::REQUEST_CONNECTIONS_ACTIVE).decrement(1.0),
            ConnectionKind::Subscriber => gauge!(names::SUBSCRIBERS_ACTIVE).decrement(1.0),
        }
    }
}
