//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lifecycle_requests_total` (counter): requests by method, status
//! - `lifecycle_request_duration_seconds` (histogram): latency distribution
//! - `lifecycle_rate_limited_total` (counter): requests rejected with 429
//! - `lifecycle_coalesced_total` (counter): calls joined onto an in-flight operation
//! - `lifecycle_coalescer_executions_total` (counter): operations actually started
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics recorder"),
    }
}

/// Record a completed request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    counter!("lifecycle_requests_total", &labels).increment(1);
    histogram!("lifecycle_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

/// Record a request rejected by the rate limiter.
pub fn record_rate_limited() {
    counter!("lifecycle_rate_limited_total").increment(1);
}

/// Record a call that joined an in-flight operation.
pub fn record_coalesced() {
    counter!("lifecycle_coalesced_total").increment(1);
}

/// Record a fresh execution started by the coalescer.
pub fn record_execution() {
    counter!("lifecycle_coalescer_executions_total").increment(1);
}
