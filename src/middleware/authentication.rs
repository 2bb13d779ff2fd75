//! # Authentication Stage
//!
//! Verifies the bearer token against the configured key material.
//!
//! - A presented token is always verified, even on routes that do not require one.
//! - A missing token is rejected only when the matched route requires
//!   authentication (`authRequired`, falling back to `auth.required_by_default`).
//! - Unmatched requests use the gateway default, so without a token they get 401
//!   before they can get 404.

use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::identity::extract_bearer_token;
use crate::auth::jwt::TokenValidator;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, RequestContext};
use crate::middleware::pipeline::{Stage, StageOutcome};

pub const AUTHENTICATION_PRIORITY: i32 = 100;

#[derive(Debug)]
pub struct AuthenticationStage {
    validator: Arc<TokenValidator>,
    required_by_default: bool,
}

impl AuthenticationStage {
    pub fn new(validator: Arc<TokenValidator>, required_by_default: bool) -> Self {
        Self {
            validator,
            required_by_default,
        }
    }

    fn token_required(&self, ctx: &RequestContext) -> bool {
        ctx.matched_route
            .as_ref()
            .and_then(|route| route.auth_required)
            .unwrap_or(self.required_by_default)
    }
}

#[async_trait]
impl Stage for AuthenticationStage {
    fn name(&self) -> &str {
        "authentication"
    }

    fn priority(&self) -> i32 {
        AUTHENTICATION_PRIORITY
    }

    async fn process_request(
        &self,
        request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageOutcome> {
        match extract_bearer_token(&request.headers) {
            Some(token) => {
                let principal = self.validator.validate(token)?;
                ctx.principal = Some(Arc::new(principal));
            }
            None if self.token_required(ctx) => return Err(GatewayError::TokenMissing),
            None => {}
        }
        Ok(StageOutcome::Continue)
    }
}
