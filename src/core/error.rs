//! # Error Handling Module
//!
//! All failures the gateway can detect locally are represented by [`GatewayError`].
//! Each variant knows its HTTP status, a stable snake_case identifier used in logs
//! and metrics, and the slug that ends the RFC 7807 `type` URI.
//!
//! Errors are plain data: they are returned with `?` through the pipeline stages and
//! rendered exactly once, at the pipeline boundary, by the problem formatter in
//! [`crate::core::problem`]. Nothing here formats a response body with internal
//! details; the `Display` text is for logs only.
//!
//! ## Rust Concepts Used
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - `From` impls let `?` convert library errors into gateway errors automatically
//! - Struct-like enum variants carry the context needed to build a response

use axum::http::StatusCode;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every error the gateway can produce
///
/// The first block of variants is the client-facing taxonomy; the second block covers
/// infrastructure failures, which are always rendered as a sanitized 500.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// No bearer token on a route that requires authentication
    #[error("Bearer token missing")]
    TokenMissing,

    /// Token is malformed, has a bad signature, or fails claim checks
    ///
    /// `reason` is only ever logged, never sent to the client.
    #[error("Bearer token invalid: {reason}")]
    TokenInvalid { reason: String },

    /// Token signature is fine but `exp` is in the past
    #[error("Bearer token expired")]
    TokenExpired,

    /// Consumer is not on the matched route's whitelist
    #[error("Consumer {consumer_id} is not allowed on route {route_id}")]
    ConsumerForbidden {
        consumer_id: String,
        route_id: String,
    },

    /// Token bucket for the reported scope is empty
    #[error("Rate limit exceeded ({scope}): {limit} requests per second")]
    RateLimited {
        scope: String,
        limit: u32,
        retry_after_secs: u64,
    },

    /// No published route matches the request
    #[error("No route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Upstream refused the connection or could not be reached
    #[error("Upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    /// Upstream did not answer within the configured timeout
    #[error("Upstream timed out after {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    /// Request body exceeds the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Shared state store failure (connection, script, decode)
    #[error("State store error: {message}")]
    StateStore { message: String },

    /// Route source could not produce a catalog
    #[error("Route source error: {message}")]
    RouteSource { message: String },

    /// Anything else that should never reach a client with its details
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn token_invalid<S: Into<String>>(reason: S) -> Self {
        Self::TokenInvalid {
            reason: reason.into(),
        }
    }

    pub fn state_store<S: Into<String>>(message: S) -> Self {
        Self::StateStore {
            message: message.into(),
        }
    }

    pub fn route_source<S: Into<String>>(message: S) -> Self {
        Self::RouteSource {
            message: message.into(),
        }
    }

    pub fn route_not_found<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    pub fn upstream_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::UpstreamUnavailable {
            reason: reason.into(),
        }
    }

    /// HTTP status code sent to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TokenMissing | Self::TokenInvalid { .. } | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::ConsumerForbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Configuration { .. }
            | Self::StateStore { .. }
            | Self::RouteSource { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Json { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable identifier for logs
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::TokenMissing => "token_missing",
            Self::TokenInvalid { .. } => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::ConsumerForbidden { .. } => "consumer_forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Configuration { .. } => "configuration",
            Self::StateStore { .. } => "state_store",
            Self::RouteSource { .. } => "route_source",
            Self::Internal { .. } => "internal",
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
            Self::Yaml { .. } => "yaml",
        }
    }

    /// Last segment of the problem `type` URI
    ///
    /// Infrastructure errors all collapse to `internal-error` so the client cannot
    /// tell a Redis outage from a bad config file.
    pub fn problem_slug(&self) -> &'static str {
        match self {
            Self::TokenMissing => "token-missing",
            Self::TokenInvalid { .. } => "token-invalid",
            Self::TokenExpired => "token-expired",
            Self::ConsumerForbidden { .. } => "consumer-forbidden",
            Self::RateLimited { .. } => "rate-limit-exceeded",
            Self::RouteNotFound { .. } => "route-not-found",
            Self::UpstreamUnavailable { .. } => "upstream-unavailable",
            Self::UpstreamTimeout { .. } => "upstream-timeout",
            Self::PayloadTooLarge { .. } => "payload-too-large",
            _ => "internal-error",
        }
    }

    /// Whether the error belongs to the authentication family (401)
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::TokenMissing | Self::TokenInvalid { .. } | Self::TokenExpired
        )
    }

    /// Whether this error is an infrastructure failure rather than a client outcome
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::StateStore {
            message: err.to_string(),
        }
    }
}
