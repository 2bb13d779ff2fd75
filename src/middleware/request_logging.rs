//! # Request Logging Stage
//!
//! One structured event per completed request. Server errors log at `warn`,
//! everything else at `info`.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::types::{GatewayResponse, RequestContext};
use crate::middleware::pipeline::Stage;
use crate::observability::metrics::{upstream_label, UNKNOWN};

/// Runs last on the response path
pub const REQUEST_LOGGING_PRIORITY: i32 = 500;

#[derive(Debug, Default)]
pub struct RequestLoggingStage;

impl RequestLoggingStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for RequestLoggingStage {
    fn name(&self) -> &str {
        "request_logging"
    }

    fn priority(&self) -> i32 {
        REQUEST_LOGGING_PRIORITY
    }

    async fn process_response(&self, response: &mut GatewayResponse, ctx: &RequestContext) {
        let route_id = ctx.route_id().unwrap_or(UNKNOWN);
        let upstream = ctx
            .matched_route
            .as_deref()
            .map(|route| upstream_label(&route.upstream_url))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let rate_limit_type = ctx.rate_limit.as_ref().map(|o| o.reported.scope.as_str());
        let rate_limit_degraded = ctx.rate_limit.as_ref().map(|o| o.degraded).unwrap_or(false);
        let duration_ms = ctx.elapsed().as_millis() as u64;
        let status = response.status.as_u16();

        if response.status.is_server_error() {
            warn!(
                correlation_id = %ctx.correlation_id,
                consumer_id = %ctx.consumer_id,
                client_ip = %ctx.client_ip,
                method = %ctx.method,
                path = %ctx.path,
                status,
                route_id,
                upstream = %upstream,
                duration_ms,
                rate_limit_type,
                rate_limit_degraded,
                error_type = ctx.error_type,
                "Request failed"
            );
        } else {
            info!(
                correlation_id = %ctx.correlation_id,
                consumer_id = %ctx.consumer_id,
                client_ip = %ctx.client_ip,
                method = %ctx.method,
                path = %ctx.path,
                status,
                route_id,
                upstream = %upstream,
                duration_ms,
                rate_limit_type,
                rate_limit_degraded,
                error_type = ctx.error_type,
                "Request processed"
            );
        }
    }
}
