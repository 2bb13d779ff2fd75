//! # Consumer Identity Stage
//!
//! Resolves the consumer id (token claim, then `X-Consumer-ID`, then `anonymous`)
//! and enforces the matched route's consumer whitelist. The resolved id is also
//! forwarded upstream in `X-Consumer-ID`, replacing whatever the client sent.

use async_trait::async_trait;
use axum::http::HeaderValue;

use crate::auth::identity::resolve_consumer_id;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, RequestContext, CONSUMER_ID_HEADER};
use crate::middleware::pipeline::{Stage, StageOutcome};

pub const CONSUMER_PRIORITY: i32 = 200;

#[derive(Debug, Default)]
pub struct ConsumerIdentityStage;

impl ConsumerIdentityStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for ConsumerIdentityStage {
    fn name(&self) -> &str {
        "consumer"
    }

    fn priority(&self) -> i32 {
        CONSUMER_PRIORITY
    }

    async fn process_request(
        &self,
        request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageOutcome> {
        let consumer_id = resolve_consumer_id(ctx.principal.as_deref(), &request.headers);

        if let Some(route) = ctx.matched_route.as_ref() {
            if !route.allows_consumer(&consumer_id) {
                return Err(GatewayError::ConsumerForbidden {
                    consumer_id,
                    route_id: route.id.clone(),
                });
            }
        }

        match HeaderValue::from_str(&consumer_id) {
            Ok(value) => {
                request.headers.insert(CONSUMER_ID_HEADER, value);
            }
            Err(_) => {
                request.headers.remove(CONSUMER_ID_HEADER);
            }
        }
        ctx.consumer_id = consumer_id;
        Ok(StageOutcome::Continue)
    }
}
