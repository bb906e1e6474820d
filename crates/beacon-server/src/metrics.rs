//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format on a dedicated port.

use beacon_core::WorkerRegistry;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const WORKERS_ACTIVE: &str = "beacon_workers_active";
    pub const UPDATES_TOTAL: &str = "beacon_updates_total";
    pub const NOTIFICATIONS_TOTAL: &str = "beacon_notifications_total";
    pub const ACKS_TOTAL: &str = "beacon_acks_total";
    pub const ROUTE_ATTEMPTS_TOTAL: &str = "beacon_route_attempts_total";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of client sockets accepted since start"
    );
    metrics::describe_gauge!(
        names::WORKERS_ACTIVE,
        "Current number of connected session workers"
    );
    metrics::describe_counter!(
        names::UPDATES_TOTAL,
        "Total number of accepted channel updates"
    );
    metrics::describe_counter!(
        names::NOTIFICATIONS_TOTAL,
        "Total number of notifications flushed to clients"
    );
    metrics::describe_counter!(names::ACKS_TOTAL, "Total number of acknowledged updates");
    metrics::describe_counter!(
        names::ROUTE_ATTEMPTS_TOTAL,
        "Total number of routed delivery attempts"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted update, labelled by where it came from.
pub fn record_update(source: &'static str) {
    counter!(names::UPDATES_TOTAL, "source" => source).increment(1);
}

/// Record flushed notifications.
pub fn record_notifications(count: usize) {
    counter!(names::NOTIFICATIONS_TOTAL).increment(count as u64);
}

/// Record an acknowledged update.
pub fn record_ack() {
    counter!(names::ACKS_TOTAL).increment(1);
}

/// Record a routed delivery attempt, labelled by outcome.
pub fn record_route(result: &'static str) {
    counter!(names::ROUTE_ATTEMPTS_TOTAL, "result" => result).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish the live worker count once a second until shutdown.
pub fn spawn_worker_gauge(registry: Arc<WorkerRegistry>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    gauge!(names::WORKERS_ACTIVE).set(registry.len() as f64);
                }
            }
        }
    });
}

/// Metrics guard accounting one client session; decrements on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a guard, recording the connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}
