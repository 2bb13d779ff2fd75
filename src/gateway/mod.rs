//! # Gateway Module
//!
//! The HTTP surfaces (gateway and admin) and the upstream dispatcher.

pub mod server;
pub mod upstream;

pub use server::{build_admin_app, build_gateway_app, build_pipeline, AdminState, GatewayServer, GatewayState};
pub use upstream::HttpDispatcher;
