//! # Route Data Model
//!
//! Routes, rate-limit policies and consumer limits as published by the control plane.
//! The gateway only reads these; their lifecycle (draft → pending → published/rejected)
//! is owned elsewhere. Field names are camelCase on the wire so the same documents can
//! be served by the control plane, stored in a route file, or embedded in config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle state of a route; only `Published` routes are ever routable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Draft,
    Pending,
    Published,
    Rejected,
}

/// A path-prefix to upstream mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Stable identifier, used in metrics labels and bucket keys
    pub id: String,

    /// Path prefix without trailing slash (`/` for the root route)
    pub path: String,

    /// Base URL the stripped path is appended to
    pub upstream_url: String,

    /// Allowed methods, upper case; empty means any method
    #[serde(default)]
    pub methods: BTreeSet<String>,

    pub status: RouteStatus,

    /// Route-level rate-limit policy
    #[serde(default)]
    pub rate_limit_id: Option<String>,

    /// Overrides the gateway default for token requirement
    #[serde(default)]
    pub auth_required: Option<bool>,

    /// Consumer whitelist; empty means every consumer is allowed
    #[serde(default)]
    pub allowed_consumers: Vec<String>,
}

impl Route {
    /// Whether the route accepts the given method
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Whether the consumer passes the route whitelist
    pub fn allows_consumer(&self, consumer_id: &str) -> bool {
        self.allowed_consumers.is_empty()
            || self.allowed_consumers.iter().any(|c| c == consumer_id)
    }

    /// Path to send upstream: the request path with this route's prefix removed
    ///
    /// An exact match forwards `/`.
    pub fn strip_prefix<'a>(&self, request_path: &'a str) -> &'a str {
        let prefix = normalize_route_path(&self.path);
        let rest = request_path.strip_prefix(prefix.as_str()).unwrap_or(request_path);
        if rest.is_empty() {
            "/"
        } else {
            rest
        }
    }
}

/// Canonical form of a route path used as the snapshot key
///
/// Trailing slashes are removed, a missing leading slash is added, and the root
/// route maps to the empty string so every request path has it as a prefix.
pub fn normalize_route_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Token-bucket parameters shared by routes that reference it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub id: String,

    /// Refill rate in tokens per second
    pub requests_per_second: u32,

    /// Bucket capacity
    pub burst_size: u32,
}

/// Token-bucket parameters keyed by consumer identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRateLimit {
    pub consumer_id: String,
    pub requests_per_second: u32,
    pub burst_size: u32,
}

/// Everything the route source returns in one bulk read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteCatalog {
    pub routes: Vec<Route>,
    pub rate_limit_policies: Vec<RateLimitPolicy>,
    pub consumer_rate_limits: Vec<ConsumerRateLimit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Route {
        Route {
            id: "r1".to_string(),
            path: path.to_string(),
            upstream_url: "http://svc:8080".to_string(),
            methods: BTreeSet::new(),
            status: RouteStatus::Published,
            rate_limit_id: None,
            auth_required: None,
            allowed_consumers: Vec::new(),
        }
    }

    #[test]
    fn test_normalize_route_path() {
        assert_eq!(normalize_route_path("/api/orders/"), "/api/orders");
        assert_eq!(normalize_route_path("api/orders"), "/api/orders");
        assert_eq!(normalize_route_path("/"), "");
        assert_eq!(normalize_route_path(""), "");
    }

    #[test]
    fn test_strip_prefix() {
        let r = route("/api/orders");
        assert_eq!(r.strip_prefix("/api/orders"), "/");
        assert_eq!(r.strip_prefix("/api/orders/123/items"), "/123/items");

        let root = route("/");
        assert_eq!(root.strip_prefix("/anything"), "/anything");
    }

    #[test]
    fn test_method_and_consumer_filters() {
        let mut r = route("/api");
        assert!(r.allows_method("DELETE"));
        r.methods = BTreeSet::from(["GET".to_string(), "POST".to_string()]);
        assert!(r.allows_method("get"));
        assert!(!r.allows_method("DELETE"));

        assert!(r.allows_consumer("anyone"));
        r.allowed_consumers = vec!["billing".to_string()];
        assert!(r.allows_consumer("billing"));
        assert!(!r.allows_consumer("anonymous"));
    }

    #[test]
    fn test_catalog_wire_format() {
        let json = r#"{
            "routes": [{"id": "a", "path": "/a", "upstreamUrl": "http://a", "methods": ["GET"], "status": "draft"}],
            "consumerRateLimits": [{"consumerId": "c", "requestsPerSecond": 3, "burstSize": 2}]
        }"#;
        let catalog: RouteCatalog = serde_json::from_str(json).unwrap();
        assert_eq!(catalog.routes[0].status, RouteStatus::Draft);
        assert!(catalog.rate_limit_policies.is_empty());
        assert_eq!(catalog.consumer_rate_limits[0].burst_size, 2);
    }
}
