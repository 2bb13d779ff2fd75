//! # Rate Limiting Stage
//!
//! Applies the matched route's policy (per client IP) and the consumer's own limit
//! through the distributed limiter. Policies are read from the snapshot pinned by the
//! route lookup stage. The decision is kept in the context so the response phase can
//! stamp `X-RateLimit-*` headers on allowed and denied responses alike; requests with
//! no applicable policy get no headers.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayRequest, GatewayResponse, RequestContext};
use crate::middleware::pipeline::{Stage, StageOutcome};
use crate::traffic::rate_limiter::DistributedRateLimiter;

pub const RATE_LIMITING_PRIORITY: i32 = 300;

#[derive(Debug)]
pub struct RateLimitStage {
    limiter: Arc<DistributedRateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<DistributedRateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &str {
        "rate_limiting"
    }

    fn priority(&self) -> i32 {
        RATE_LIMITING_PRIORITY
    }

    async fn process_request(
        &self,
        _request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageOutcome> {
        let (Some(route), Some(snapshot)) = (ctx.matched_route.clone(), ctx.snapshot.clone()) else {
            return Ok(StageOutcome::Continue);
        };

        let route_policy = route
            .rate_limit_id
            .as_deref()
            .and_then(|id| snapshot.policy(id))
            .map(|policy| (route.id.as_str(), policy));
        let consumer_limit = snapshot.consumer_limit(&ctx.consumer_id);

        let Some(outcome) = self
            .limiter
            .check(route_policy, &ctx.client_ip, consumer_limit)
            .await
        else {
            return Ok(StageOutcome::Continue);
        };

        let denied = (!outcome.allowed).then(|| outcome.to_error());
        ctx.rate_limit = Some(outcome);
        match denied {
            Some(error) => Err(error),
            None => Ok(StageOutcome::Continue),
        }
    }

    async fn process_response(&self, response: &mut GatewayResponse, ctx: &RequestContext) {
        if let Some(outcome) = ctx.rate_limit.as_ref() {
            outcome.apply_headers(response);
        }
    }
}
