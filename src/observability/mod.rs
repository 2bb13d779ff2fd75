//! # Observability Module
//!
//! Structured logging setup and gateway metrics.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{install_prometheus_recorder, normalize_path, RequestLabels};
