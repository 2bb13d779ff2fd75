//! # Route Lookup Stage
//!
//! Resolves the route for the request from the current cache snapshot and pins that
//! snapshot in the context, so later stages read policies from the same generation
//! the route came from. Never short-circuits: an unmatched request reaches the end
//! of the request phase and gets its 404 there.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayRequest, RequestContext};
use crate::middleware::pipeline::{Stage, StageOutcome};
use crate::routing::cache::RouteCache;

pub const ROUTE_LOOKUP_PRIORITY: i32 = 50;

#[derive(Debug)]
pub struct RouteLookupStage {
    cache: Arc<RouteCache>,
}

impl RouteLookupStage {
    pub fn new(cache: Arc<RouteCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Stage for RouteLookupStage {
    fn name(&self) -> &str {
        "route_lookup"
    }

    fn priority(&self) -> i32 {
        ROUTE_LOOKUP_PRIORITY
    }

    async fn process_request(
        &self,
        request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageOutcome> {
        let snapshot = self.cache.snapshot();
        ctx.matched_route = snapshot.lookup(request.method.as_str(), request.path());
        ctx.snapshot = Some(snapshot);
        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::route::{Route, RouteCatalog, RouteStatus};
    use crate::routing::source::StaticRouteSource;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;

    fn route(id: &str, path: &str) -> Route {
        Route {
            id: id.to_string(),
            path: path.to_string(),
            upstream_url: "http://orders:8080".to_string(),
            methods: Default::default(),
            status: RouteStatus::Published,
            rate_limit_id: None,
            auth_required: None,
            allowed_consumers: Vec::new(),
        }
    }

    fn request(path: &str) -> GatewayRequest {
        GatewayRequest::new(
            Method::GET,
            path.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:9".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_match_and_snapshot_are_recorded() {
        let source = Arc::new(StaticRouteSource::new(RouteCatalog {
            routes: vec![route("orders", "/api/orders")],
            ..Default::default()
        }));
        let cache = Arc::new(RouteCache::new(source));
        cache.refresh().await.unwrap();
        let stage = RouteLookupStage::new(Arc::clone(&cache));

        let mut req = request("/api/orders/7");
        let mut ctx = RequestContext::new(&req);
        let outcome = stage.process_request(&mut req, &mut ctx).await.unwrap();

        assert!(matches!(outcome, StageOutcome::Continue));
        assert_eq!(ctx.route_id(), Some("orders"));
        assert_eq!(ctx.snapshot.as_ref().map(|s| s.generation()), Some(1));

        let mut req = request("/api/ordershistory");
        let mut ctx = RequestContext::new(&req);
        stage.process_request(&mut req, &mut ctx).await.unwrap();
        assert!(ctx.matched_route.is_none());
        assert!(ctx.snapshot.is_some());
    }
}
