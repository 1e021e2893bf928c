//! Prometheus metrics for the trip saga.
//!
//! Metric families:
//! - Trip lifecycle (creations, transitions, conflicts, expirations)
//! - Event bus publish/consume
//! - Dispatch queries
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use rideflow_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and returns `Ok` without starting a listener.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    // `ExporterError` (metrics-exporter-prometheus 0.15) implements
                    // neither `Debug` nor `Display`, so it cannot be logged as a field.
                    if exporter.await.is_err() {
                        tracing::error!("Metrics listener stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Trip lifecycle
    describe_counter!("trips_created_total", "Total number of trips requested");
    describe_counter!(
        "trip_transitions_total",
        "Committed trip status transitions, labelled by transition"
    );
    describe_counter!(
        "trip_assignment_conflicts_total",
        "Assignment attempts that lost the race for a trip"
    );
    describe_counter!(
        "trips_expired_total",
        "Requested trips cancelled by the expiry sweep"
    );
    describe_counter!(
        "trip_operation_errors_total",
        "Saga operation failures, labelled by error kind"
    );
    describe_histogram!(
        "expiry_sweep_duration_seconds",
        "Time taken by one expiry sweep"
    );

    // Event bus
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of messages published to event bus"
    );
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total number of messages consumed from event bus"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Publishes abandoned after exhausting retries"
    );
    describe_counter!(
        "event_bus_consume_errors_total",
        "Total number of consume errors"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to publish messages, including retries"
    );

    // Dispatch
    describe_histogram!(
        "dispatch_candidates",
        "Number of candidates returned per dispatch query"
    );
    describe_histogram!(
        "dispatch_query_duration_seconds",
        "Time taken to answer a dispatch query"
    );
    describe_gauge!(
        "drivers_available",
        "Online, idle drivers at the last availability count"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted max retries"
    );
}

/// Trip lifecycle metrics recorder.
pub struct TripMetrics;

impl TripMetrics {
    /// Record a trip creation.
    pub fn record_created() {
        counter!("trips_created_total").increment(1);
    }

    /// Record a committed transition.
    pub fn record_transition(transition: &'static str) {
        counter!("trip_transitions_total", "transition" => transition).increment(1);
    }

    /// Record a lost assignment race.
    pub fn record_conflict() {
        counter!("trip_assignment_conflicts_total").increment(1);
    }

    /// Record expiry cancellations.
    pub fn record_expired(count: u64) {
        counter!("trips_expired_total").increment(count);
    }

    /// Record a failed operation.
    pub fn record_error(kind: &'static str) {
        counter!("trip_operation_errors_total", "kind" => kind).increment(1);
    }

    /// Record one sweep.
    pub fn record_sweep(duration: Duration) {
        histogram!("expiry_sweep_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a message publish.
    pub fn record_publish(subject: &str, duration: Duration) {
        counter!("event_bus_messages_published_total", "subject" => subject.to_string())
            .increment(1);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a message consumption.
    pub fn record_consume(subject: &str) {
        counter!("event_bus_messages_consumed_total", "subject" => subject.to_string())
            .increment(1);
    }

    /// Record an abandoned publish.
    pub fn record_publish_error(subject: &str) {
        counter!("event_bus_publish_errors_total", "subject" => subject.to_string())
            .increment(1);
    }

    /// Record a consume error.
    pub fn record_consume_error() {
        counter!("event_bus_consume_errors_total").increment(1);
    }
}

/// Dispatch metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record a candidate query.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_query(candidates: usize, duration: Duration) {
        histogram!("dispatch_candidates").record(candidates as f64);
        histogram!("dispatch_query_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the current available-driver count.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_available(count: u64) {
        gauge!("drivers_available").set(count as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        TripMetrics::record_created();
        TripMetrics::record_transition("assign");
        EventBusMetrics::record_publish("trip.created", Duration::from_millis(5));

        // If another test installed the recorder first, handle is None.
        // Metrics are still recorded globally.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("trips_created_total"));
            assert!(rendered.contains("trip_transitions_total"));
            assert!(rendered.contains("event_bus_messages_published_total"));
        }
    }
}
