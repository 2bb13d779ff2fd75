//! # Core Types Module
//!
//! Request, response and per-request context types shared by every pipeline stage.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - `Bytes` bodies are reference counted, so cloning a request or response never copies the payload
//! - `Arc<T>` lets the context point into the current route snapshot without copying routes
//! - `RequestContext` is owned by one request and passed as `&mut` through the stages,
//!   which replaces any thread-local or task-local ambient state

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::routing::cache::RouteSnapshot;
use crate::routing::route::Route;
use crate::traffic::rate_limiter::RateLimitOutcome;

/// Correlation id header, read from the client and echoed on every response
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Consumer id header, used when the token carries no usable consumer claim
pub const CONSUMER_ID_HEADER: &str = "x-consumer-id";

/// Inbound request as seen by the pipeline
///
/// The body is fully buffered before the pipeline runs; the server enforces the
/// configured size limit while collecting it.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// HTTP method
    pub method: Method,

    /// Request URI including path and query
    pub uri: Uri,

    /// Request headers (stages may add to these, e.g. the correlation id)
    pub headers: HeaderMap,

    /// Buffered request body
    pub body: Bytes,

    /// Address of the TCP peer
    pub remote_addr: SocketAddr,
}

impl GatewayRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            remote_addr,
        }
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Header value as UTF-8, `None` when absent or not valid text
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Response produced either by the upstream dispatcher or by a stage short-circuit
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Empty-bodied response with the given status
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    /// Set a header, silently skipping values that are not valid header text
    pub fn set_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    /// Header value as UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

impl axum::response::IntoResponse for GatewayResponse {
    fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Verified identity extracted from a bearer token
#[derive(Debug, Clone, Default)]
pub struct AuthenticatedPrincipal {
    /// `sub` claim
    pub subject: Option<String>,

    /// `iss` claim
    pub issuer: Option<String>,

    /// `azp` (authorized party) claim
    pub authorized_party: Option<String>,

    /// `clientId` claim, used when `azp` is absent
    pub client_id: Option<String>,

    /// Full claim set for stages that need more than the common fields
    pub claims: serde_json::Value,
}

/// Per-request state threaded through all pipeline stages
///
/// Created at pipeline entry and dropped when the response has been produced.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id, either client supplied or generated
    pub correlation_id: String,

    /// Client address used for per-client rate-limit buckets
    pub client_ip: String,

    /// Resolved consumer identity (`anonymous` until the consumer stage runs)
    pub consumer_id: String,

    /// Principal from a validated bearer token, if one was presented
    pub principal: Option<Arc<AuthenticatedPrincipal>>,

    /// Route matched for this request
    pub matched_route: Option<Arc<Route>>,

    /// Snapshot the route was resolved from; policies are read from the same snapshot
    pub snapshot: Option<Arc<RouteSnapshot>>,

    /// Rate-limit decision, used for response headers
    pub rate_limit: Option<RateLimitOutcome>,

    /// Kind of the gateway error that produced the response, if any
    pub error_type: Option<&'static str>,

    /// Request method as text, for labels and logs
    pub method: String,

    /// Request path, used as the problem `instance`
    pub path: String,

    /// Pipeline entry time
    pub start_time: Instant,
}

impl RequestContext {
    pub fn new(request: &GatewayRequest) -> Self {
        Self {
            correlation_id: String::new(),
            client_ip: crate::auth::identity::resolve_client_ip(&request.headers, request.remote_addr),
            consumer_id: crate::auth::identity::ANONYMOUS_CONSUMER.to_string(),
            principal: None,
            matched_route: None,
            snapshot: None,
            rate_limit: None,
            error_type: None,
            method: request.method.as_str().to_string(),
            path: request.path().to_string(),
            start_time: Instant::now(),
        }
    }

    /// Time since pipeline entry
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn route_id(&self) -> Option<&str> {
        self.matched_route.as_deref().map(|route| route.id.as_str())
    }
}
