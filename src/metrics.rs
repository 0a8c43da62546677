//! Metrics for fulfillment dispatch, authentication and certificates.
//!
//! Metrics go through the `metrics` facade; nothing is recorded unless the
//! embedding binary installs a recorder (see `--metrics-addr`).

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use tracing::debug;

use crate::error::{AuthError, DispatchError};

// === Metric Name Constants ===

/// Fulfillment requests counter metric name.
pub const METRIC_REQUESTS: &str = "fulfillment_requests_total";
/// Action latency metric name.
pub const METRIC_ACTION_LATENCY: &str = "fulfillment_action_latency_ms";
/// Basic auth failures counter metric name.
pub const METRIC_AUTH_FAILURES: &str = "auth_failures_total";
/// Certificates obtained counter metric name.
pub const METRIC_CERTIFICATES_OBTAINED: &str = "acme_certificates_obtained_total";
/// Certificate failures counter metric name.
pub const METRIC_CERTIFICATE_FAILURES: &str = "acme_failures_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_counter!(
        METRIC_REQUESTS,
        "Total number of fulfillment requests by action and outcome"
    );
    describe_histogram!(
        METRIC_ACTION_LATENCY,
        "Action handler latency in milliseconds"
    );
    describe_counter!(
        METRIC_AUTH_FAILURES,
        "Total number of rejected basic auth attempts by reason"
    );
    describe_counter!(
        METRIC_CERTIFICATES_OBTAINED,
        "Total number of certificates obtained from the ACME directory"
    );
    describe_counter!(
        METRIC_CERTIFICATE_FAILURES,
        "Total number of failed certificate obtain attempts"
    );

    debug!("Metrics initialized");
}

/// Record a successfully dispatched request.
pub fn record_dispatch_success(action: &str) {
    counter!(METRIC_REQUESTS, "action" => action.to_owned(), "outcome" => "ok").increment(1);
}

/// Record a failed dispatch.
pub fn record_dispatch_failure(err: &DispatchError) {
    let action = match err {
        DispatchError::UnsupportedAction(action)
        | DispatchError::ActionFailed { action, .. }
        | DispatchError::Serialize { action, .. } => action.clone(),
        _ => String::new(),
    };
    counter!(METRIC_REQUESTS, "action" => action, "outcome" => err.outcome()).increment(1);
}

/// Record handler latency for `action`.
pub fn record_action_latency(action: &str, start: Instant) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_ACTION_LATENCY, "action" => action.to_owned()).record(latency_ms);
}

/// Record a rejected basic auth attempt.
pub fn record_auth_failure(err: &AuthError) {
    counter!(METRIC_AUTH_FAILURES, "reason" => err.reason()).increment(1);
}

/// Record a certificate obtained from the CA.
pub fn record_certificate_obtained() {
    counter!(METRIC_CERTIFICATES_OBTAINED).increment(1);
}

/// Record a failed certificate attempt.
pub fn record_certificate_failure() {
    counter!(METRIC_CERTIFICATE_FAILURES).increment(1);
}
