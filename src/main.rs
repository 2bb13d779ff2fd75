//! # Edge Gateway - Main Entry Point
//!
//! Loads configuration, installs logging and the metrics recorder, builds the
//! gateway and serves until SIGINT or SIGTERM.
//!
//! The configuration file is taken from `GATEWAY_CONFIG_PATH`
//! (default `config/gateway.yaml`); `GATEWAY_*` variables override single fields.

use anyhow::Context;
use tracing::{info, warn};

use edge_gateway::core::config::DEFAULT_CONFIG_PATH;
use edge_gateway::observability::{init_logging, install_prometheus_recorder};
use edge_gateway::{GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = GatewayConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_logging(&config.observability);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        "Starting edge gateway"
    );

    let prometheus = if config.observability.metrics_enabled {
        match install_prometheus_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Metrics recorder unavailable, continuing without /metrics");
                None
            }
        }
    } else {
        None
    };

    let server = GatewayServer::from_config(config, prometheus)
        .await
        .context("Failed to build gateway")?;
    server.run().await.context("Gateway server failed")?;

    info!("Edge gateway shutdown complete");
    Ok(())
}
