//! # Middleware Module
//!
//! The request pipeline and its stages, listed in execution order:
//!
//! | priority | stage | request phase | response phase |
//! |---|---|---|---|
//! | 0 | correlation | resolve/generate `X-Correlation-ID` | echo it |
//! | 50 | route_lookup | pin snapshot, match route | |
//! | 100 | authentication | verify bearer token | |
//! | 200 | consumer | resolve consumer, check whitelist | |
//! | 300 | rate_limiting | route + consumer buckets | `X-RateLimit-*` headers |
//! | 400 | metrics | | request metrics |
//! | 500 | request_logging | | access log |

pub mod authentication;
pub mod consumer;
pub mod correlation;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiting;
pub mod request_logging;
pub mod route_lookup;

pub use authentication::AuthenticationStage;
pub use consumer::ConsumerIdentityStage;
pub use correlation::CorrelationStage;
pub use metrics::MetricsStage;
pub use pipeline::{Dispatcher, Pipeline, Stage, StageOutcome};
pub use rate_limiting::RateLimitStage;
pub use request_logging::RequestLoggingStage;
pub use route_lookup::RouteLookupStage;
