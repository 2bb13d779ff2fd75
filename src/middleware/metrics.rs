//! # Metrics Stage
//!
//! Records the per-request counter, latency histogram and error counter once the
//! response is final. Runs in the response phase only, so short-circuited requests
//! are counted like proxied ones.

use async_trait::async_trait;

use crate::core::types::{GatewayResponse, RequestContext};
use crate::middleware::pipeline::Stage;
use crate::observability::metrics::{record_request, RequestLabels};

pub const METRICS_PRIORITY: i32 = 400;

#[derive(Debug, Default)]
pub struct MetricsStage;

impl MetricsStage {
    pub fn new() -> Self {
        Self
    }
}

/// Labels for a finished request
pub fn request_labels(response: &GatewayResponse, ctx: &RequestContext) -> RequestLabels {
    let route = ctx
        .matched_route
        .as_deref()
        .map(|route| (route.id.as_str(), route.upstream_url.as_str()));
    RequestLabels::new(&ctx.method, &ctx.path, route, response.status)
}

#[async_trait]
impl Stage for MetricsStage {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        METRICS_PRIORITY
    }

    async fn process_response(&self, response: &mut GatewayResponse, ctx: &RequestContext) {
        record_request(&request_labels(response, ctx), ctx.elapsed());
    }
}
