//! Request metrics middleware.
//!
//! Concrete paths carry request numbers, intake ids, and other per-entity
//! segments; using them as label values would explode metric cardinality.
//! Every request is therefore collapsed to its route family before anything
//! reaches a label, and statuses are bucketed by class.
//!
//! Recorded per request:
//! - `api_requests_total{method, route, status_class}`
//! - `api_request_errors_total{route}` for 5xx responses
//! - `api_request_duration_seconds` histogram

use std::time::Instant;

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};

use crate::metrics::global_metrics;

/// Collapse a concrete request path into its route family.
pub fn route_family(path: &str) -> &'static str {
    if path == "/health" || path == "/health/detailed" || path == "/ready" {
        return "health";
    }
    if path == "/metrics" {
        return "metrics";
    }
    if path.starts_with("/auth/mfa/") {
        return "auth_mfa";
    }
    if path.starts_with("/auth/") {
        return "auth";
    }
    if path.starts_with("/webhooks/intakes/") {
        return "webhook_admin";
    }
    if path.starts_with("/webhooks/") {
        return "webhooks";
    }
    if path.starts_with("/internal/") {
        return "internal";
    }
    "other"
}

/// Bucket a status code by class: "2xx", "3xx", "4xx", "5xx".
pub fn status_class(status: StatusCode) -> &'static str {
    if status.is_success() {
        "2xx"
    } else if status.is_redirection() {
        "3xx"
    } else if status.is_client_error() {
        "4xx"
    } else if status.is_server_error() {
        "5xx"
    } else {
        "1xx"
    }
}

/// Axum middleware recording the per-request metric family.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let route = route_family(request.uri().path());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let m = global_metrics();
    m.increment_counter(
        "api_requests_total",
        &[
            ("method", method.as_str()),
            ("route", route),
            ("status_class", status_class(status)),
        ],
    );
    if status.is_server_error() {
        m.increment_counter("api_request_errors_total", &[("route", route)]);
    }
    m.record_histogram("api_request_duration_seconds", start.elapsed().as_secs_f64());

    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
