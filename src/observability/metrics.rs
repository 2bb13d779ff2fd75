//! # Gateway Metrics
//!
//! Recording goes through the `metrics` facade; the Prometheus exporter is installed
//! once at startup and rendered by the admin `/metrics` endpoint.
//!
//! ## Request metrics
//! Every completed request, whether proxied or short-circuited, records
//! `gateway_requests_total` and `gateway_request_duration_seconds` labelled by
//! `route_id`, `route_path`, `upstream`, `method` and `status` (status class).
//! 4xx/5xx outcomes additionally increment `gateway_errors_total` with an
//! `error_type` derived from the status code.
//!
//! `route_path` is the request path with identifier segments replaced by templates
//! (`{uuid}`, `{id}`) to keep label cardinality bounded.

use axum::http::StatusCode;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};

/// Label value used when no route matched
pub const UNKNOWN: &str = "unknown";

/// Latency histogram buckets in seconds
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Minimum length for an alphanumeric segment to be treated as an opaque id
const OPAQUE_ID_MIN_LEN: usize = 16;

/// Install the Prometheus recorder and return the handle used for rendering
pub fn install_prometheus_recorder() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}

/// Label set for the per-request metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLabels {
    pub route_id: String,
    pub route_path: String,
    pub upstream: String,
    pub method: String,
    pub status: StatusCode,
}

impl RequestLabels {
    /// Labels for a request; route-derived labels are `unknown` when nothing matched
    pub fn new(
        method: &str,
        request_path: &str,
        route: Option<(&str, &str)>,
        status: StatusCode,
    ) -> Self {
        match route {
            Some((route_id, upstream_url)) => Self {
                route_id: route_id.to_string(),
                route_path: normalize_path(request_path),
                upstream: upstream_label(upstream_url),
                method: method.to_string(),
                status,
            },
            None => Self {
                route_id: UNKNOWN.to_string(),
                route_path: UNKNOWN.to_string(),
                upstream: UNKNOWN.to_string(),
                method: method.to_string(),
                status,
            },
        }
    }
}

/// Record the request counter, the duration histogram and, for errors, the error counter
pub fn record_request(labels: &RequestLabels, duration: Duration) {
    let status = status_class(labels.status);

    metrics::counter!(
        "gateway_requests_total",
        "route_id" => labels.route_id.clone(),
        "route_path" => labels.route_path.clone(),
        "upstream" => labels.upstream.clone(),
        "method" => labels.method.clone(),
        "status" => status
    )
    .increment(1);

    metrics::histogram!(
        "gateway_request_duration_seconds",
        "route_id" => labels.route_id.clone(),
        "route_path" => labels.route_path.clone(),
        "upstream" => labels.upstream.clone(),
        "method" => labels.method.clone(),
        "status" => status
    )
    .record(duration.as_secs_f64());

    if let Some(error_type) = classify_error(labels.status) {
        metrics::counter!(
            "gateway_errors_total",
            "route_id" => labels.route_id.clone(),
            "route_path" => labels.route_path.clone(),
            "upstream" => labels.upstream.clone(),
            "method" => labels.method.clone(),
            "status" => status,
            "error_type" => error_type
        )
        .increment(1);
    }
}

pub fn record_rate_limit_decision(scope: &'static str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    metrics::counter!("gateway_rate_limit_decisions_total", "scope" => scope, "outcome" => outcome)
        .increment(1);
}

pub fn record_rate_limit_fallback(scope: &'static str) {
    metrics::counter!("gateway_rate_limit_fallback_total", "scope" => scope).increment(1);
}

pub fn record_route_cache_refresh(outcome: &'static str) {
    metrics::counter!("gateway_route_cache_refreshes_total", "outcome" => outcome).increment(1);
}

pub fn record_route_cache_state(routes: usize, generation: u64) {
    metrics::gauge!("gateway_route_cache_routes").set(routes as f64);
    metrics::gauge!("gateway_route_cache_generation").set(generation as f64);
}

/// `2xx`, `3xx`, `4xx` or `5xx`
pub fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Error type for 4xx/5xx statuses, `None` otherwise
pub fn classify_error(status: StatusCode) -> Option<&'static str> {
    match status.as_u16() {
        429 => Some("rate_limited"),
        404 => Some("not_found"),
        502 | 504 => Some("upstream_error"),
        401 | 403 => Some("auth_error"),
        400..=499 => Some("client_error"),
        500..=599 => Some("internal_error"),
        _ => None,
    }
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("uuid pattern is valid")
    })
}

fn is_opaque_id(segment: &str) -> bool {
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    segment.len() >= OPAQUE_ID_MIN_LEN
        && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && segment.chars().any(|c| c.is_ascii_digit())
}

/// Replace identifier segments with templates
///
/// `/api/orders/3fa85f64-5717-4562-b3fc-2c963f66afa6/items/42` becomes
/// `/api/orders/{uuid}/items/{id}`.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment
            } else if uuid_pattern().is_match(segment) {
                "{uuid}"
            } else if is_opaque_id(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// `host:port` of an upstream URL, `unknown` when it cannot be parsed
pub fn upstream_label(upstream_url: &str) -> String {
    match Url::parse(upstream_url) {
        Ok(url) => match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => UNKNOWN.to_string(),
        },
        Err(_) => UNKNOWN.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/orders/3fa85f64-5717-4562-b3fc-2c963f66afa6/items/42"),
            "/api/orders/{uuid}/items/{id}"
        );
        assert_eq!(normalize_path("/api/users/a1b2c3d4e5f6g7h8i9"), "/api/users/{id}");
        assert_eq!(normalize_path("/api/users/profile"), "/api/users/profile");
        assert_eq!(normalize_path("/api/v2/orders"), "/api/v2/orders");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/api/orders/"), "/api/orders/");
    }

    #[test]
    fn test_long_words_without_digits_are_kept() {
        assert_eq!(
            normalize_path("/api/internationalization"),
            "/api/internationalization"
        );
    }

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(StatusCode::OK), "2xx");
        assert_eq!(status_class(StatusCode::MOVED_PERMANENTLY), "3xx");
        assert_eq!(status_class(StatusCode::NOT_FOUND), "4xx");
        assert_eq!(status_class(StatusCode::BAD_GATEWAY), "5xx");
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error(StatusCode::OK), None);
        assert_eq!(classify_error(StatusCode::TOO_MANY_REQUESTS), Some("rate_limited"));
        assert_eq!(classify_error(StatusCode::NOT_FOUND), Some("not_found"));
        assert_eq!(classify_error(StatusCode::BAD_GATEWAY), Some("upstream_error"));
        assert_eq!(classify_error(StatusCode::GATEWAY_TIMEOUT), Some("upstream_error"));
        assert_eq!(classify_error(StatusCode::UNAUTHORIZED), Some("auth_error"));
        assert_eq!(classify_error(StatusCode::FORBIDDEN), Some("auth_error"));
        assert_eq!(classify_error(StatusCode::BAD_REQUEST), Some("client_error"));
        assert_eq!(classify_error(StatusCode::SERVICE_UNAVAILABLE), Some("internal_error"));
    }

    #[test]
    fn test_labels_without_route() {
        let labels = RequestLabels::new("GET", "/nowhere/1", None, StatusCode::NOT_FOUND);
        assert_eq!(labels.route_id, UNKNOWN);
        assert_eq!(labels.route_path, UNKNOWN);
        assert_eq!(labels.upstream, UNKNOWN);
    }

    #[test]
    fn test_upstream_label() {
        assert_eq!(upstream_label("http://orders:8080/base"), "orders:8080");
        assert_eq!(upstream_label("https://billing.internal"), "billing.internal:443");
        assert_eq!(upstream_label("not a url"), UNKNOWN);
    }
}
