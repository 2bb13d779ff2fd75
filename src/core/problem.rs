//! # Problem Details (RFC 7807)
//!
//! Every response the gateway generates itself is an `application/problem+json`
//! document:
//!
//! ```json
//! {
//!   "type": "https://gateway.local/errors/rate-limit-exceeded",
//!   "title": "Too Many Requests",
//!   "status": 429,
//!   "detail": "Rate limit exceeded. Retry after 1 seconds.",
//!   "instance": "/api/orders/42",
//!   "correlationId": "3fa85f64-5717-4562-b3fc-2c963f66afa6"
//! }
//! ```
//!
//! `detail` comes from a fixed table per error kind. The error's own message, which
//! may name an upstream address or a library error, is never copied into the body.

use axum::http::{header, HeaderValue};
use bytes::Bytes;
use serde::Serialize;

use crate::core::error::GatewayError;
use crate::core::types::GatewayResponse;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// RFC 7807 body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub correlation_id: String,
}

/// Renders gateway errors as problem responses
#[derive(Debug, Clone)]
pub struct ProblemFormatter {
    base_uri: String,
}

impl ProblemFormatter {
    pub fn new(base_uri: impl Into<String>) -> Self {
        let base_uri: String = base_uri.into();
        Self {
            base_uri: base_uri.trim_end_matches('/').to_string(),
        }
    }

    /// Problem document for an error
    pub fn problem(&self, error: &GatewayError, instance: &str, correlation_id: &str) -> ProblemDetails {
        let status = error.status_code();
        ProblemDetails {
            problem_type: format!("{}/{}", self.base_uri, error.problem_slug()),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: detail_for(error),
            instance: instance.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Full response: status, problem body, content type and `WWW-Authenticate` for 401s
    pub fn render(&self, error: &GatewayError, instance: &str, correlation_id: &str) -> GatewayResponse {
        let problem = self.problem(error, instance, correlation_id);
        let body = serde_json::to_vec(&problem).unwrap_or_else(|_| {
            br#"{"title":"Internal Server Error","status":500}"#.to_vec()
        });

        let mut response = GatewayResponse::empty(error.status_code());
        response.body = Bytes::from(body);
        response
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_CONTENT_TYPE));

        if let Some(challenge) = www_authenticate(error) {
            response
                .headers
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        }
        response
    }
}

impl Default for ProblemFormatter {
    fn default() -> Self {
        Self::new(crate::core::config::ErrorFormatConfig::default().type_base_uri)
    }
}

fn www_authenticate(error: &GatewayError) -> Option<&'static str> {
    match error {
        GatewayError::TokenMissing => Some("Bearer"),
        GatewayError::TokenInvalid { .. } => Some(r#"Bearer error="invalid_token""#),
        GatewayError::TokenExpired => {
            Some(r#"Bearer error="invalid_token", error_description="The token has expired""#)
        }
        _ => None,
    }
}

fn detail_for(error: &GatewayError) -> String {
    match error {
        GatewayError::TokenMissing => {
            "A bearer token is required to access this resource.".to_string()
        }
        GatewayError::TokenInvalid { .. } => "The bearer token is invalid.".to_string(),
        GatewayError::TokenExpired => "The bearer token has expired.".to_string(),
        GatewayError::ConsumerForbidden { .. } => {
            "The consumer is not allowed to access this route.".to_string()
        }
        GatewayError::RateLimited {
            retry_after_secs, ..
        } => format!(
            "Rate limit exceeded. Retry after {} seconds.",
            retry_after_secs
        ),
        GatewayError::RouteNotFound { .. } => {
            "No route matches the requested path.".to_string()
        }
        GatewayError::UpstreamUnavailable { .. } => {
            "The upstream service is unavailable.".to_string()
        }
        GatewayError::UpstreamTimeout { .. } => {
            "The upstream service did not respond in time.".to_string()
        }
        GatewayError::PayloadTooLarge { limit } => {
            format!("The request body exceeds the limit of {} bytes.", limit)
        }
        _ => "An unexpected error occurred.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn formatter() -> ProblemFormatter {
        ProblemFormatter::new("https://gateway.test/errors/")
    }

    #[test]
    fn test_token_missing_problem() {
        let response = formatter().render(&GatewayError::TokenMissing, "/api/orders", "cid-1");
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.header("content-type"), Some(PROBLEM_CONTENT_TYPE));
        assert_eq!(response.header("www-authenticate"), Some("Bearer"));

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["type"], "https://gateway.test/errors/token-missing");
        assert_eq!(body["title"], "Unauthorized");
        assert_eq!(body["status"], 401);
        assert_eq!(body["instance"], "/api/orders");
        assert_eq!(body["correlationId"], "cid-1");
    }

    #[test]
    fn test_expired_token_challenge() {
        let response = formatter().render(&GatewayError::TokenExpired, "/", "c");
        assert!(response
            .header("www-authenticate")
            .unwrap()
            .starts_with("Bearer error=\"invalid_token\""));
    }

    #[test]
    fn test_internal_details_never_leak() {
        let errors = [
            GatewayError::upstream_unavailable("tcp connect error 10.0.3.7:8443 refused"),
            GatewayError::state_store("redis://cache:6379 ECONNRESET"),
            GatewayError::token_invalid("InvalidSignature at jsonwebtoken::crypto"),
            GatewayError::internal("panicked at src/lib.rs:10"),
        ];
        for error in errors {
            let response = formatter().render(&error, "/x", "c");
            let body = String::from_utf8(response.body.to_vec()).unwrap();
            assert!(!body.contains("10.0.3.7"), "{}", body);
            assert!(!body.contains("6379"), "{}", body);
            assert!(!body.contains("jsonwebtoken"), "{}", body);
            assert!(!body.contains("panicked"), "{}", body);
        }
    }

    #[test]
    fn test_infrastructure_errors_render_as_generic_500() {
        let problem = formatter().problem(&GatewayError::config("bad"), "/x", "c");
        assert_eq!(problem.status, 500);
        assert_eq!(problem.problem_type, "https://gateway.test/errors/internal-error");
        assert_eq!(problem.detail, "An unexpected error occurred.");
    }

    #[test]
    fn test_rate_limited_detail() {
        let problem = formatter().problem(
            &GatewayError::RateLimited {
                scope: "consumer".into(),
                limit: 3,
                retry_after_secs: 2,
            },
            "/api",
            "c",
        );
        assert_eq!(problem.status, 429);
        assert!(problem.problem_type.ends_with("/rate-limit-exceeded"));
        assert!(problem.detail.contains('2'));
    }
}
