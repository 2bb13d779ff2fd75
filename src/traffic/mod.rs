//! # Traffic Module
//!
//! Token-bucket admission control: the bucket arithmetic, the shared state stores
//! that hold bucket state, and the limiter that combines route and consumer limits.

pub mod rate_limiter;
pub mod store;
pub mod token_bucket;

pub use rate_limiter::{DistributedRateLimiter, LimitScope, RateLimitOutcome, ScopeDecision};
pub use store::{InMemoryStateStore, RedisStateStore, StateStore, StoreError};
pub use token_bucket::{BucketSpec, BucketState, Decision};
