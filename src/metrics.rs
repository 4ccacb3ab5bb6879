//! Prometheus metrics for the gateway and the services.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Proxied requests (labels: service, status)
//! - `gateway_rate_limited_total` - Requests rejected by the fixed-window limiter
//! - `gateway_auth_rejections_total` - Requests rejected by credential checks (label: reason)
//! - `gateway_auth_failure_bursts_total` - Failures from an address past its failure budget
//! - `gateway_upstream_failures_total` - Upstream errors (labels: service, reason)
//! - `events_published_total` - Publish attempts (labels: routing_key, status)
//! - `events_handled_total` - Handler outcomes (labels: routing_key, outcome)
//! - `event_bus_reconnects_total` - Broker reconnection attempts
//! - `cache_lookups_total` - Cache-through lookups (label: result)
//! - `circuit_breaker_opens_total` - Upstream breaker trips (label: service)
//!
//! ## Histograms
//! - `gateway_upstream_duration_seconds` - Upstream round trip (label: service)
//!
//! ## Gauges
//! - `event_bus_connection_status` - 1 = connected, 0 = not connected
//! - `circuit_breaker_state` - 0 = closed, 1 = half-open, 2 = open (label: service)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const GATEWAY_RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const GATEWAY_AUTH_REJECTIONS_TOTAL: &str = "gateway_auth_rejections_total";
    pub const GATEWAY_AUTH_FAILURE_BURSTS_TOTAL: &str = "gateway_auth_failure_bursts_total";
    pub const GATEWAY_UPSTREAM_FAILURES_TOTAL: &str = "gateway_upstream_failures_total";
    pub const GATEWAY_UPSTREAM_DURATION_SECONDS: &str = "gateway_upstream_duration_seconds";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
    pub const EVENTS_HANDLED_TOTAL: &str = "events_handled_total";
    pub const EVENT_BUS_RECONNECTS_TOTAL: &str = "event_bus_reconnects_total";
    pub const EVENT_BUS_CONNECTION_STATUS: &str = "event_bus_connection_status";
    pub const CACHE_LOOKUPS_TOTAL: &str = "cache_lookups_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
}

/// Install the Prometheus exporter and describe every metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::GATEWAY_REQUESTS_TOTAL, "Requests relayed by the gateway");
    describe_counter!(
        names::GATEWAY_RATE_LIMITED_TOTAL,
        "Requests rejected by the distributed rate limiter"
    );
    describe_counter!(
        names::GATEWAY_AUTH_REJECTIONS_TOTAL,
        "Requests rejected by bearer token verification"
    );
    describe_counter!(
        names::GATEWAY_AUTH_FAILURE_BURSTS_TOTAL,
        "Authentication failures from addresses past their failure budget"
    );
    describe_counter!(
        names::GATEWAY_UPSTREAM_FAILURES_TOTAL,
        "Upstream connection failures, timeouts and open circuits"
    );
    describe_histogram!(
        names::GATEWAY_UPSTREAM_DURATION_SECONDS,
        "Upstream round trip in seconds"
    );
    describe_counter!(names::EVENTS_PUBLISHED_TOTAL, "Domain event publish attempts");
    describe_counter!(names::EVENTS_HANDLED_TOTAL, "Domain event handler outcomes");
    describe_counter!(
        names::EVENT_BUS_RECONNECTS_TOTAL,
        "Event bus reconnection attempts"
    );
    describe_gauge!(
        names::EVENT_BUS_CONNECTION_STATUS,
        "Event bus connection status (1 = connected, 0 = not connected)"
    );
    describe_counter!(names::CACHE_LOOKUPS_TOTAL, "Cache-through lookups by result");
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Times an upstream circuit breaker opened"
    );
    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Upstream circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: Option<SocketAddr>) {
    if let Some(addr) = metrics_addr
        && let Err(e) = init_metrics(addr)
    {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Gateway
// =============================================================================

pub fn record_gateway_request(service: &str, status: u16) {
    counter!(names::GATEWAY_REQUESTS_TOTAL, "service" => service.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_rate_limited() {
    counter!(names::GATEWAY_RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_auth_rejection(reason: &'static str) {
    counter!(names::GATEWAY_AUTH_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_auth_failure_burst() {
    counter!(names::GATEWAY_AUTH_FAILURE_BURSTS_TOTAL).increment(1);
}

pub fn record_upstream_failure(service: &str, reason: &'static str) {
    counter!(names::GATEWAY_UPSTREAM_FAILURES_TOTAL, "service" => service.to_string(), "reason" => reason)
        .increment(1);
}

pub fn record_upstream_duration(service: &str, duration_secs: f64) {
    histogram!(names::GATEWAY_UPSTREAM_DURATION_SECONDS, "service" => service.to_string())
        .record(duration_secs);
}

/// Record circuit breaker opening.
pub fn record_circuit_breaker_open(service: &str) {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL, "service" => service.to_string()).increment(1);
}

/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(service: &str, state: u8) {
    gauge!(names::CIRCUIT_BREAKER_STATE, "service" => service.to_string()).set(f64::from(state));
}

// =============================================================================
// Event Bus
// =============================================================================

pub fn record_event_published(routing_key: &str, status: &'static str) {
    counter!(names::EVENTS_PUBLISHED_TOTAL, "routing_key" => routing_key.to_string(), "status" => status)
        .increment(1);
}

pub fn record_event_handled(routing_key: &str, outcome: &'static str) {
    counter!(names::EVENTS_HANDLED_TOTAL, "routing_key" => routing_key.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_reconnect_attempt() {
    counter!(names::EVENT_BUS_RECONNECTS_TOTAL).increment(1);
}

pub fn set_connection_status(connected: bool) {
    gauge!(names::EVENT_BUS_CONNECTION_STATUS).set(if connected { 1.0 } else { 0.0 });
}

// =============================================================================
// Cache
// =============================================================================

pub fn record_cache_lookup(hit: bool) {
    counter!(names::CACHE_LOOKUPS_TOTAL, "result" => if hit { "hit" } else { "miss" })
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed exporter must be a no-op.

    #[test]
    fn test_record_gateway_metrics() {
        record_gateway_request("post", 200);
        record_rate_limited();
        record_auth_rejection("missing");
        record_auth_failure_burst();
        record_upstream_failure("post", "timeout");
        record_upstream_duration("post", 0.05);
    }

    #[test]
    fn test_record_event_metrics() {
        record_event_published("post.created", "success");
        record_event_handled("post.created", "acked");
        record_reconnect_attempt();
        set_connection_status(true);
        set_connection_status(false);
    }

    #[test]
    fn test_record_misc_metrics() {
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_circuit_breaker_open("media");
        set_circuit_breaker_state("media", 2);
    }
}
