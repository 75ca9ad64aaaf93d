//! Prometheus metrics for the forwarding core.
//!
//! Everything records through the `metrics` facade. [`install_recorder`]
//! installs the Prometheus exporter whose handle renders `/metrics`; without
//! an installed recorder the calls below do nothing.
//!
//! The `endpoint` label carries the matched route pattern, not the raw path,
//! so label cardinality stays bounded by the route table.

use axum::http::Method;
use metrics::{counter, gauge, histogram, Label};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::circuit_breaker::CircuitState;
use crate::rate_limit::{KeyType, RateLimitBucket};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const ERRORS_TOTAL: &str = "gateway_errors_total";
pub const PROXY_RETRIES_TOTAL: &str = "gateway_proxy_retries_total";
pub const CIRCUIT_STATE: &str = "gateway_circuit_state";
pub const CIRCUIT_OPEN_TOTAL: &str = "gateway_circuit_open_total";
pub const RATE_LIMIT_EXCEEDED_TOTAL: &str = "gateway_ratelimit_exceeded_total";
pub const RATE_LIMIT_ABUSE_TOTAL: &str = "gateway_ratelimit_abuse_total";
pub const AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";

/// Values of the `type` label on [`ERRORS_TOTAL`].
pub mod error_kind {
    pub const PROXY_TIMEOUT: &str = "proxy_timeout";
    pub const PROXY_EXCEPTION: &str = "proxy_exception";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const RATE_LIMIT_UNAVAILABLE: &str = "ratelimit_unavailable";
}

/// Install the process-wide Prometheus recorder.
///
/// Fails if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// One proxied request and the status the caller received.
pub fn record_request(method: &Method, endpoint: &str, status: u16, elapsed: Duration) {
    let labels = vec![
        Label::new("method", method.as_str().to_string()),
        Label::new("endpoint", endpoint.to_string()),
        Label::new("status", status.to_string()),
    ];
    counter!(REQUESTS_TOTAL, labels.clone()).increment(1);
    histogram!(REQUEST_DURATION_SECONDS, labels).record(elapsed.as_secs_f64());
}

pub fn mark_error(kind: &'static str) {
    counter!(ERRORS_TOTAL, "type" => kind).increment(1);
}

pub fn mark_retry(route: &str) {
    counter!(PROXY_RETRIES_TOTAL, "route" => route.to_string()).increment(1);
}

/// Publish a breaker transition. The gauge reads 0 closed, 1 open, 2 half-open.
pub fn set_circuit_state(route: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!(CIRCUIT_STATE, "route" => route.to_string()).set(value);
    if state == CircuitState::Open {
        counter!(CIRCUIT_OPEN_TOTAL, "route" => route.to_string()).increment(1);
    }
}

pub fn mark_rate_limit_exceeded(tenant: &str, bucket: RateLimitBucket) {
    counter!(
        RATE_LIMIT_EXCEEDED_TOTAL,
        "tenant" => tenant.to_string(),
        "bucket" => bucket.as_str()
    )
    .increment(1);
}

pub fn mark_abuse(key_type: KeyType) {
    counter!(RATE_LIMIT_ABUSE_TOTAL, "key_type" => key_type.as_str()).increment(1);
}

pub fn mark_auth_failure(reason: &'static str) {
    counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}
