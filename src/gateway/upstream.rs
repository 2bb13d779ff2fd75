//! # Upstream Dispatcher
//!
//! Forwards a request to the matched route's upstream over a pooled `reqwest` client.
//!
//! - The upstream URL is the route's `upstreamUrl` followed by the request path with
//!   the route prefix removed, plus the original query string.
//! - Hop-by-hop headers and `Host` are dropped in both directions, together with any
//!   header named in the `Connection` header.
//! - Upstream status, headers and body are passed through unchanged, error statuses
//!   included.
//! - Connection failures become 502, timeouts become 504.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::UpstreamConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, GatewayResponse, RequestContext};
use crate::middleware::pipeline::Dispatcher;
use crate::routing::route::Route;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Copy headers that are meaningful end to end
pub fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name == header::HOST
            || HOP_BY_HOP_HEADERS.contains(&name.as_str())
            || connection_listed.contains(name)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Full upstream URL for a request on a route
pub fn upstream_url(route: &Route, request_path: &str, query: Option<&str>) -> String {
    let base = route.upstream_url.trim_end_matches('/');
    let path = route.strip_prefix(request_path);
    match query {
        Some(query) if !query.is_empty() => format!("{}{}?{}", base, path, query),
        _ => format!("{}{}", base, path),
    }
}

/// HTTP dispatcher backed by a shared connection pool
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    response_timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.response_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build upstream client: {}", e)))?;

        Ok(Self {
            client,
            response_timeout: config.response_timeout,
        })
    }

    fn map_error(&self, error: reqwest::Error) -> GatewayError {
        if error.is_timeout() {
            GatewayError::UpstreamTimeout {
                timeout_ms: self.response_timeout.as_millis() as u64,
            }
        } else {
            GatewayError::upstream_unavailable(error.to_string())
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        request: &GatewayRequest,
        ctx: &RequestContext,
    ) -> GatewayResult<GatewayResponse> {
        let route = ctx
            .matched_route
            .as_deref()
            .ok_or_else(|| GatewayError::route_not_found(ctx.method.clone(), ctx.path.clone()))?;

        let url = upstream_url(route, request.path(), request.query());
        debug!(
            correlation_id = %ctx.correlation_id,
            route_id = %route.id,
            "Dispatching to upstream"
        );

        let upstream_response = self
            .client
            .request(request.method.clone(), url.as_str())
            .headers(end_to_end_headers(&request.headers))
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    route_id = %route.id,
                    error = %e,
                    "Upstream request failed"
                );
                self.map_error(e)
            })?;

        let status = upstream_response.status();
        let headers = end_to_end_headers(upstream_response.headers());
        let body = upstream_response.bytes().await.map_err(|e| {
            warn!(
                correlation_id = %ctx.correlation_id,
                route_id = %route.id,
                error = %e,
                "Reading upstream body failed"
            );
            self.map_error(e)
        })?;

        Ok(GatewayResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::route::RouteStatus;
    use axum::http::{HeaderValue, Method, StatusCode};
    use bytes::Bytes;
    use std::sync::Arc;
    use wiremock::matchers::{header as header_matcher, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn route(prefix: &str, upstream: &str) -> Route {
        Route {
            id: "orders".to_string(),
            path: prefix.to_string(),
            upstream_url: upstream.to_string(),
            methods: Default::default(),
            status: RouteStatus::Published,
            rate_limit_id: None,
            auth_required: None,
            allowed_consumers: Vec::new(),
        }
    }

    fn dispatcher(response_timeout: Duration) -> HttpDispatcher {
        HttpDispatcher::new(&UpstreamConfig {
            connect_timeout: Duration::from_millis(500),
            response_timeout,
            ..Default::default()
        })
        .unwrap()
    }

    fn request(uri: &str, headers: HeaderMap) -> (GatewayRequest, RequestContext) {
        let req = GatewayRequest::new(
            Method::GET,
            uri.parse().unwrap(),
            headers,
            Bytes::new(),
            "127.0.0.1:9".parse().unwrap(),
        );
        let ctx = RequestContext::new(&req);
        (req, ctx)
    }

    #[test]
    fn test_upstream_url() {
        let r = route("/api/orders", "http://orders:8080/v1/");
        assert_eq!(upstream_url(&r, "/api/orders/42", None), "http://orders:8080/v1/42");
        assert_eq!(upstream_url(&r, "/api/orders", Some("a=1")), "http://orders:8080/v1/?a=1");
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-internal"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-internal", HeaderValue::from_static("1"));
        headers.insert("host", HeaderValue::from_static("gateway"));
        headers.insert("x-correlation-id", HeaderValue::from_static("abc"));

        let forwarded = end_to_end_headers(&headers);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get("x-correlation-id").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_passthrough_of_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items/7"))
            .and(query_param("expand", "true"))
            .and(header_matcher("x-correlation-id", "cid"))
            .respond_with(
                ResponseTemplate::new(418)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("short and stout"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", HeaderValue::from_static("cid"));
        let (req, mut ctx) = request("/api/items/7?expand=true", headers);
        ctx.matched_route = Some(Arc::new(route("/api", &server.uri())));

        let response = dispatcher(Duration::from_secs(5)).dispatch(&req, &ctx).await.unwrap();
        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(response.header("x-upstream"), Some("yes"));
        assert_eq!(response.body, Bytes::from_static(b"short and stout"));
    }

    #[tokio::test]
    async fn test_slow_upstream_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let (req, mut ctx) = request("/api/slow", HeaderMap::new());
        ctx.matched_route = Some(Arc::new(route("/api", &server.uri())));

        let err = dispatcher(Duration::from_millis(200))
            .dispatch(&req, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout { timeout_ms: 200 }));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (req, mut ctx) = request("/api/x", HeaderMap::new());
        ctx.matched_route = Some(Arc::new(route("/api", &format!("http://127.0.0.1:{}", port))));

        let err = dispatcher(Duration::from_secs(5)).dispatch(&req, &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
