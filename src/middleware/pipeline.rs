//! # Request Pipeline
//!
//! An ordered chain of stages around a single upstream dispatch.
//!
//! ## Execution model
//! - Stages run their request phase in ascending priority order.
//! - A stage may short-circuit by returning a response or an error. Errors are
//!   rendered as RFC 7807 problems immediately, so nothing downstream of the
//!   failing stage runs and the upstream is never contacted.
//! - When every stage continues, the request is dispatched to the matched route's
//!   upstream, or answered with 404 when nothing matched.
//! - The response phase runs for every stage in reverse order regardless of where
//!   the request phase stopped, so correlation ids, rate-limit headers, metrics and
//!   the access log cover short-circuited requests too.
//!
//! ## Rust Concepts Used
//! - `async_trait` for async methods on the `Stage` and `Dispatcher` traits
//! - `Arc<dyn Stage>` for a heterogeneous, shareable stage list
//! - `&mut RequestContext` instead of task-local state: each stage sees what the
//!   previous ones resolved

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

use crate::auth::identity::resolve_correlation_id;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::problem::ProblemFormatter;
use crate::core::types::{GatewayRequest, GatewayResponse, RequestContext};

/// What a stage decided about the request
#[derive(Debug)]
pub enum StageOutcome {
    /// Hand the request to the next stage
    Continue,
    /// Stop here and answer with this response
    Respond(GatewayResponse),
}

/// One step of the pipeline
#[async_trait]
pub trait Stage: Send + Sync + fmt::Debug {
    /// Stage name for logs
    fn name(&self) -> &str;

    /// Lower numbers run first on the request path
    fn priority(&self) -> i32 {
        100
    }

    /// Inspect or modify the request; may short-circuit
    async fn process_request(
        &self,
        _request: &mut GatewayRequest,
        _ctx: &mut RequestContext,
    ) -> GatewayResult<StageOutcome> {
        Ok(StageOutcome::Continue)
    }

    /// Decorate the outgoing response; runs for every request
    async fn process_response(&self, _response: &mut GatewayResponse, _ctx: &RequestContext) {}
}

/// Terminal step: forwards the request to the matched route's upstream
#[async_trait]
pub trait Dispatcher: Send + Sync + fmt::Debug {
    async fn dispatch(
        &self,
        request: &GatewayRequest,
        ctx: &RequestContext,
    ) -> GatewayResult<GatewayResponse>;
}

/// Ordered stage chain plus dispatcher
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    dispatcher: Arc<dyn Dispatcher>,
    problems: ProblemFormatter,
}

impl Pipeline {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, problems: ProblemFormatter) -> Self {
        Self {
            stages: Vec::new(),
            dispatcher,
            problems,
        }
    }

    /// Add a stage, keeping the list sorted by priority
    ///
    /// Stages with equal priority keep their insertion order.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self.stages.sort_by_key(|s| s.priority());
        self
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a request through every stage and return the final response
    ///
    /// Never fails: every error ends up as a problem response.
    pub async fn handle(&self, mut request: GatewayRequest) -> GatewayResponse {
        let mut ctx = RequestContext::new(&request);
        self.handle_with_context(&mut request, &mut ctx).await
    }

    /// Same as [`Pipeline::handle`] with a caller-owned context
    pub async fn handle_with_context(
        &self,
        request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResponse {
        let mut response = self.run_request_phase(request, ctx).await;

        for stage in self.stages.iter().rev() {
            stage.process_response(&mut response, ctx).await;
        }
        response
    }

    /// Answer a request that failed before the stages could run, e.g. an oversized body
    ///
    /// The response phase still runs so the rejection is correlated, counted and logged.
    pub async fn reject(&self, request: &GatewayRequest, error: GatewayError) -> GatewayResponse {
        let mut ctx = RequestContext::new(request);
        ctx.correlation_id = resolve_correlation_id(&request.headers);
        let mut response = self.render_error(&error, &mut ctx);

        for stage in self.stages.iter().rev() {
            stage.process_response(&mut response, &ctx).await;
        }
        response
    }

    async fn run_request_phase(
        &self,
        request: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResponse {
        for stage in &self.stages {
            match stage.process_request(request, ctx).await {
                Ok(StageOutcome::Continue) => {}
                Ok(StageOutcome::Respond(response)) => {
                    debug!(stage = stage.name(), status = %response.status, "Stage responded");
                    return response;
                }
                Err(e) => {
                    debug!(stage = stage.name(), error_type = e.error_type(), "Stage rejected request");
                    return self.render_error(&e, ctx);
                }
            }
        }

        if ctx.matched_route.is_none() {
            let e = GatewayError::route_not_found(ctx.method.clone(), ctx.path.clone());
            return self.render_error(&e, ctx);
        }

        match self.dispatcher.dispatch(request, ctx).await {
            Ok(response) => response,
            Err(e) => self.render_error(&e, ctx),
        }
    }

    fn render_error(&self, error: &GatewayError, ctx: &mut RequestContext) -> GatewayResponse {
        if error.is_internal() {
            error!(
                correlation_id = %ctx.correlation_id,
                error = %error,
                "Internal error while handling request"
            );
        }
        ctx.error_type = Some(error.error_type());
        self.problems.render(error, &ctx.path, &ctx.correlation_id)
    }
}
