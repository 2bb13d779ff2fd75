//! # Correlation Stage
//!
//! Runs first. Accepts the client's `X-Correlation-ID` or generates a UUID v4,
//! forwards it upstream, and echoes it on every response including problem
//! responses produced by later stages.

use async_trait::async_trait;
use axum::http::HeaderValue;

use crate::auth::identity::resolve_correlation_id;
use crate::core::error::GatewayResult;
use crate::core::types::{GatewayRequest, GatewayResponse, RequestContext, CORRELATION_ID_HEADER};
use crate::middleware::pipeline::{Stage, StageOutcome};

pub const CORRELATION_PRIORITY: i32 = 0;

#[derive(Debug, Default)]
pub struct CorrelationStage;

impl CorrelationStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for CorrelationStage {
    fn name(&self) -> &str {
        "correlation"
    }

    fn priority(&self) -> i32 {
        CORRELATION_PRIORITY
    }

    async fn process_request(
        &self,
        request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageOutcome> {
        let correlation_id = resolve_correlation_id(&request.headers);
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            request.headers.insert(CORRELATION_ID_HEADER, value);
        }
        ctx.correlation_id = correlation_id;
        Ok(StageOutcome::Continue)
    }

    async fn process_response(&self, response: &mut GatewayResponse, ctx: &RequestContext) {
        response.set_header(CORRELATION_ID_HEADER, &ctx.correlation_id);
    }
}
