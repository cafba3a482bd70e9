//! Prometheus metrics for the dispatch client.
//!
//! Covers the request lifecycle (dispatch, attach, completion), event
//! forwarding, observer delivery, and connection retries.
//!
//! # Example
//!
//! ```rust,no_run
//! use solution_dispatch_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
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

/// Prometheus metrics endpoint.
///
/// Installs the global recorder; the rendered text is served by whatever HTTP
/// layer hosts the client.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server for the given address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (common in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the metrics endpoint is meant to be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Request lifecycle
    describe_counter!(
        "dispatch_requests_dispatched_total",
        "Requests issued to the compute service"
    );
    describe_counter!(
        "dispatch_requests_failed_total",
        "Requests that could not be initiated"
    );
    describe_counter!(
        "dispatch_requests_completed_total",
        "Requests whose done signal fired"
    );
    describe_counter!(
        "dispatch_requests_stalled_total",
        "Requests abandoned after the stall timeout"
    );
    describe_gauge!("dispatch_requests_pending", "Requests currently in flight");
    describe_histogram!(
        "dispatch_request_duration_seconds",
        "Time from dispatch to completion"
    );

    // Attach protocol
    describe_counter!("dispatch_attach_hits_total", "Successful attaches");
    describe_counter!(
        "dispatch_attach_misses_total",
        "Attaches to unknown or completed requests"
    );
    describe_counter!(
        "dispatch_dedup_hits_total",
        "Lookups that found an equivalent pending request"
    );

    // Forwarding
    describe_counter!(
        "dispatch_results_forwarded_total",
        "Results received from the compute service"
    );
    describe_counter!(
        "dispatch_errors_forwarded_total",
        "Stream errors received from the compute service"
    );
    describe_counter!(
        "dispatch_observers_evicted_total",
        "Observers dropped by the delivery policy"
    );
    describe_gauge!("dispatch_observers_attached", "Observers currently attached");

    // Connection
    describe_counter!(
        "dispatch_connect_attempts_total",
        "Connection attempts to the compute service"
    );
    describe_counter!(
        "dispatch_connect_failures_total",
        "Connection attempts that failed"
    );
}

/// Request lifecycle metrics recorder.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record a successful dispatch.
    pub fn record_dispatched() {
        counter!("dispatch_requests_dispatched_total").increment(1);
        gauge!("dispatch_requests_pending").increment(1.0);
    }

    /// Record a dispatch whose initiation failed.
    pub fn record_failed() {
        counter!("dispatch_requests_failed_total").increment(1);
    }

    /// Record a completed request.
    pub fn record_completed(duration: Duration) {
        counter!("dispatch_requests_completed_total").increment(1);
        gauge!("dispatch_requests_pending").decrement(1.0);
        histogram!("dispatch_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a request abandoned after the stall timeout.
    pub fn record_stalled() {
        counter!("dispatch_requests_stalled_total").increment(1);
        gauge!("dispatch_requests_pending").decrement(1.0);
    }
}

/// Attach protocol metrics recorder.
pub struct AttachMetrics;

impl AttachMetrics {
    /// Record an attach to a pending request.
    pub fn record_hit() {
        counter!("dispatch_attach_hits_total").increment(1);
        gauge!("dispatch_observers_attached").increment(1.0);
    }

    /// Record an attach that found nothing.
    pub fn record_miss() {
        counter!("dispatch_attach_misses_total").increment(1);
    }

    /// Record a descriptor that matched a pending request.
    pub fn record_dedup_hit() {
        counter!("dispatch_dedup_hits_total").increment(1);
    }
}

/// Forwarding metrics recorder.
pub struct ForwardingMetrics;

impl ForwardingMetrics {
    /// Record a result received from the service.
    pub fn record_result() {
        counter!("dispatch_results_forwarded_total").increment(1);
    }

    /// Record a stream error received from the service.
    pub fn record_error() {
        counter!("dispatch_errors_forwarded_total").increment(1);
    }

    /// Record an evicted observer.
    pub fn record_eviction() {
        counter!("dispatch_observers_evicted_total").increment(1);
    }

    /// Record observers leaving, through completion, eviction or disconnect.
    #[allow(clippy::cast_precision_loss)] // observer counts are far below 2^52
    pub fn record_detached(count: usize) {
        gauge!("dispatch_observers_attached").decrement(count as f64);
    }
}

/// Connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record a connection attempt.
    pub fn record_attempt() {
        counter!("dispatch_connect_attempts_total").increment(1);
    }

    /// Record a failed connection attempt.
    pub fn record_failure() {
        counter!("dispatch_connect_failures_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        RequestMetrics::record_dispatched();
        RequestMetrics::record_completed(Duration::from_millis(120));
        AttachMetrics::record_hit();
        ForwardingMetrics::record_result();

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("dispatch_requests_dispatched_total"));
            assert!(rendered.contains("dispatch_attach_hits_total"));
            assert!(rendered.contains("dispatch_results_forwarded_total"));
        }
    }

    #[tokio::test]
    async fn test_connection_metrics() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ConnectionMetrics::record_attempt();
        ConnectionMetrics::record_failure();

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("dispatch_connect_attempts_total"));
            assert!(rendered.contains("dispatch_connect_failures_total"));
        }
    }
}
