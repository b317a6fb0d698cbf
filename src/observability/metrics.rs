//! Metrics collection and exposition.
//!
//! Names and labels follow the usual gateway conventions (requests,
//! durations, bytes, connections, upstream health, security blocks).
//! The Prometheus recorder is installed once at startup; exposition is
//! served by the metrics router so `/metrics`, `/health`, and `/ready`
//! share one port.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return the render handle.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record one completed HTTP exchange.
pub fn record_http_request(method: &str, status: u16, upstream: &str, started: Instant) {
    let labels = [
        ("protocol", "http".to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("upstream", upstream.to_string()),
    ];
    counter!("gateway_requests_total", &labels).increment(1);

    let duration_labels = [
        ("protocol", "http".to_string()),
        ("method", method.to_string()),
        ("upstream", upstream.to_string()),
    ];
    histogram!("gateway_request_duration_seconds", &duration_labels)
        .record(started.elapsed().as_secs_f64());
}

/// Record one completed TCP splice session.
pub fn record_tcp_session(upstream: &str, duration: Duration, bytes_in: u64, bytes_out: u64) {
    let labels = [
        ("protocol", "tcp".to_string()),
        ("upstream", upstream.to_string()),
    ];
    counter!("gateway_requests_total", "protocol" => "tcp", "method" => "tcp", "status" => "success", "upstream" => upstream.to_string()).increment(1);
    histogram!("gateway_connection_duration_seconds", &labels).record(duration.as_secs_f64());
    counter!("gateway_request_bytes_total", "protocol" => "tcp", "direction" => "in")
        .increment(bytes_in);
    counter!("gateway_request_bytes_total", "protocol" => "tcp", "direction" => "out")
        .increment(bytes_out);
}

pub fn inc_active_connections(protocol: &'static str) {
    gauge!("gateway_active_connections", "protocol" => protocol).increment(1.0);
    counter!("gateway_connections_total", "protocol" => protocol).increment(1);
}

pub fn dec_active_connections(protocol: &'static str) {
    gauge!("gateway_active_connections", "protocol" => protocol).decrement(1.0);
}

/// Record a request or connection blocked by security policy.
pub fn record_security_block(reason: &'static str) {
    counter!("gateway_security_blocks_total", "reason" => reason).increment(1);
}

pub fn record_upstream_dial_failure(upstream: &str) {
    counter!("gateway_upstream_dial_failures_total", "upstream" => upstream.to_string())
        .increment(1);
}

pub fn set_upstream_health(upstream: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    gauge!("gateway_upstream_health", "upstream" => upstream.to_string()).set(value);
}
