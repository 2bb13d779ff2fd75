//! # Edge Gateway Library
//!
//! The request-processing runtime of an API gateway: every inbound request passes
//! through an ordered pipeline of stages before it is forwarded to the upstream
//! service its route points at.
//!
//! ## Request path
//!
//! ```text
//! correlation id -> route lookup -> authentication -> consumer identity
//!     -> rate limiting -> upstream dispatch
//! ```
//!
//! Metrics and the access log are recorded on the way back for every request,
//! including the ones a stage rejected.
//!
//! ## Module Layout
//!
//! - `core`: errors, configuration, request/response types, RFC 7807 rendering
//! - `middleware`: the pipeline and its stages
//! - `auth`: bearer-token validation and identity resolution
//! - `traffic`: token buckets, state stores and the distributed rate limiter
//! - `routing`: route model, route sources, the hot-reloadable route cache
//! - `observability`: logging setup and metrics
//! - `gateway`: axum servers and the upstream dispatcher

/// Error types, configuration, shared request types and problem rendering
pub mod core;

/// Axum applications, server lifecycle and upstream dispatch
pub mod gateway;

/// Stage pipeline
pub mod middleware;

/// Token validation and caller identity
pub mod auth;

/// Route data model, sources and cache
pub mod routing;

/// Structured logging and metrics
pub mod observability;

/// Rate limiting
pub mod traffic;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{GatewayRequest, GatewayResponse, RequestContext};
pub use gateway::server::GatewayServer;
pub use middleware::pipeline::Pipeline;
