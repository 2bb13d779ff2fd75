//! # Distributed Rate Limiter
//!
//! Admission control with two independent token buckets per request:
//!
//! - **route scope**: the matched route's policy, one bucket per route and client IP
//!   (`{prefix}:route:{routeId}:{clientIp}`)
//! - **consumer scope**: the consumer's own limit, one bucket per consumer
//!   (`{prefix}:consumer:{consumerId}`)
//!
//! When both apply they are evaluated concurrently and the request is denied if either
//! denies. Both buckets are charged when evaluated; nothing is refunded.
//!
//! ## Degradation
//! Store errors and store timeouts never fail the request. The affected scope is
//! evaluated against an in-process bucket whose rate and burst are scaled down by
//! `local_limit_factor`, and the outcome is marked degraded. Entering and leaving
//! degraded mode is logged once per transition.

use axum::http::HeaderValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::config::RateLimitingConfig;
use crate::core::error::GatewayError;
use crate::core::types::GatewayResponse;
use crate::observability::metrics;
use crate::routing::route::{ConsumerRateLimit, RateLimitPolicy};
use crate::traffic::store::{InMemoryStateStore, StateStore, StoreError};
use crate::traffic::token_bucket::{BucketSpec, Decision};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_TYPE: &str = "x-ratelimit-type";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Which bucket a decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Route,
    Consumer,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Consumer => "consumer",
        }
    }
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one bucket check, already converted to header values
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeDecision {
    pub scope: LimitScope,
    pub allowed: bool,

    /// Requests per second of the bucket that decided
    pub limit: u32,

    /// Whole tokens left
    pub remaining: u64,

    /// Seconds until the bucket is full
    pub reset_after_secs: u64,

    /// Seconds until one token is available
    pub retry_after_secs: u64,

    /// Decided by the local fallback bucket
    pub degraded: bool,
}

impl ScopeDecision {
    fn from_decision(scope: LimitScope, spec: &BucketSpec, decision: Decision, degraded: bool) -> Self {
        Self {
            scope,
            allowed: decision.allowed,
            limit: spec.limit(),
            remaining: decision.remaining(),
            reset_after_secs: spec.reset_after_secs(decision.tokens),
            retry_after_secs: spec.retry_after_secs(decision.tokens),
            degraded,
        }
    }
}

/// Combined decision for a request
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOutcome {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Decision whose numbers go into the response headers
    pub reported: ScopeDecision,

    /// At least one scope was decided by the fallback bucket
    pub degraded: bool,
}

impl RateLimitOutcome {
    /// Combine the per-scope decisions
    ///
    /// A denying scope is reported (consumer first when both deny). When everything
    /// allows, the scope with fewer tokens left is reported, ties going to consumer.
    pub fn combine(route: Option<ScopeDecision>, consumer: Option<ScopeDecision>) -> Option<Self> {
        let degraded = route.as_ref().is_some_and(|d| d.degraded)
            || consumer.as_ref().is_some_and(|d| d.degraded);
        let reported = match (route, consumer) {
            (None, None) => return None,
            (Some(only), None) | (None, Some(only)) => only,
            (Some(route), Some(consumer)) => {
                if !consumer.allowed {
                    consumer
                } else if !route.allowed {
                    route
                } else if route.remaining < consumer.remaining {
                    route
                } else {
                    consumer
                }
            }
        };
        Some(Self {
            allowed: reported.allowed,
            degraded,
            reported,
        })
    }

    /// Write the rate-limit headers; `Retry-After` only on denial
    pub fn apply_headers(&self, response: &mut GatewayResponse) {
        let r = &self.reported;
        let headers = &mut response.headers;
        headers.insert(HEADER_LIMIT, HeaderValue::from(r.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(r.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(r.reset_after_secs));
        headers.insert(HEADER_TYPE, HeaderValue::from_static(r.scope.as_str()));
        if !self.allowed {
            headers.insert(HEADER_RETRY_AFTER, HeaderValue::from(r.retry_after_secs));
        }
    }

    /// Error used to short-circuit a denied request
    pub fn to_error(&self) -> GatewayError {
        GatewayError::RateLimited {
            scope: self.reported.scope.as_str().to_string(),
            limit: self.reported.limit,
            retry_after_secs: self.reported.retry_after_secs,
        }
    }
}

/// Token-bucket limiter backed by a shared state store
#[derive(Debug)]
pub struct DistributedRateLimiter {
    store: Arc<dyn StateStore>,
    fallback: Arc<InMemoryStateStore>,
    key_prefix: String,
    store_timeout: Duration,
    local_limit_factor: f64,
    degraded: AtomicBool,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn StateStore>, config: &RateLimitingConfig) -> Self {
        Self {
            store,
            fallback: Arc::new(InMemoryStateStore::new()),
            key_prefix: config.key_prefix.clone(),
            store_timeout: config.store_timeout,
            local_limit_factor: config.local_limit_factor,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn route_key(&self, route_id: &str, client_ip: &str) -> String {
        format!("{}:route:{}:{}", self.key_prefix, route_id, client_ip)
    }

    pub fn consumer_key(&self, consumer_id: &str) -> String {
        format!("{}:consumer:{}", self.key_prefix, consumer_id)
    }

    /// Local buckets used while the shared store is unavailable
    pub fn fallback_store(&self) -> Arc<InMemoryStateStore> {
        Arc::clone(&self.fallback)
    }

    /// Whether the last store interaction failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Evaluate the applicable limits; `None` when no policy applies
    pub async fn check(
        &self,
        route: Option<(&str, &RateLimitPolicy)>,
        client_ip: &str,
        consumer: Option<&ConsumerRateLimit>,
    ) -> Option<RateLimitOutcome> {
        let route_check = async {
            match route {
                Some((route_id, policy)) => {
                    let spec = BucketSpec::new(policy.requests_per_second, policy.burst_size);
                    let key = self.route_key(route_id, client_ip);
                    Some(self.evaluate(LimitScope::Route, &key, spec).await)
                }
                None => None,
            }
        };

        let consumer_check = async {
            match consumer {
                Some(limit) => {
                    let spec = BucketSpec::new(limit.requests_per_second, limit.burst_size);
                    let key = self.consumer_key(&limit.consumer_id);
                    Some(self.evaluate(LimitScope::Consumer, &key, spec).await)
                }
                None => None,
            }
        };

        let (route_decision, consumer_decision) = tokio::join!(route_check, consumer_check);
        RateLimitOutcome::combine(route_decision, consumer_decision)
    }

    async fn evaluate(&self, scope: LimitScope, key: &str, spec: BucketSpec) -> ScopeDecision {
        let result = match tokio::time::timeout(self.store_timeout, self.store.take_token(key, &spec)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        };

        let decision = match result {
            Ok(decision) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!(store = self.store.name(), "Rate-limit state store recovered");
                }
                ScopeDecision::from_decision(scope, &spec, decision, false)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        store = self.store.name(),
                        error = %e,
                        factor = self.local_limit_factor,
                        "Rate-limit state store unavailable, using local fallback limits"
                    );
                }
                metrics::record_rate_limit_fallback(scope.as_str());
                let local = spec.scaled(self.local_limit_factor);
                let decision = self.fallback.take_token_now(key, &local);
                ScopeDecision::from_decision(scope, &local, decision, true)
            }
        };

        metrics::record_rate_limit_decision(scope.as_str(), decision.allowed);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn config() -> RateLimitingConfig {
        RateLimitingConfig::default()
    }

    fn limiter() -> DistributedRateLimiter {
        DistributedRateLimiter::new(Arc::new(InMemoryStateStore::new()), &config())
    }

    fn policy(rps: u32, burst: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            id: "p".to_string(),
            requests_per_second: rps,
            burst_size: burst,
        }
    }

    fn consumer(id: &str, rps: u32, burst: u32) -> ConsumerRateLimit {
        ConsumerRateLimit {
            consumer_id: id.to_string(),
            requests_per_second: rps,
            burst_size: burst,
        }
    }

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn take_token(&self, _key: &str, _spec: &BucketSpec) -> Result<Decision, StoreError> {
            Err(StoreError::Decode("connection refused".to_string()))
        }
    }

    #[derive(Debug)]
    struct HangingStore;

    #[async_trait]
    impl StateStore for HangingStore {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn take_token(&self, _key: &str, _spec: &BucketSpec) -> Result<Decision, StoreError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_policy_means_no_outcome() {
        assert!(limiter().check(None, "1.1.1.1", None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_burst_exhaustion() {
        let limiter = limiter();
        let p = policy(5, 3);
        let mut allowed = 0;
        for _ in 0..6 {
            let outcome = limiter.check(Some(("orders", &p)), "1.1.1.1", None).await.unwrap();
            assert_eq!(outcome.reported.scope, LimitScope::Route);
            if outcome.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_have_independent_route_buckets() {
        let limiter = limiter();
        let p = policy(1, 1);
        assert!(limiter.check(Some(("r", &p)), "1.1.1.1", None).await.unwrap().allowed);
        assert!(!limiter.check(Some(("r", &p)), "1.1.1.1", None).await.unwrap().allowed);
        assert!(limiter.check(Some(("r", &p)), "2.2.2.2", None).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stricter_consumer_limit_wins() {
        let limiter = limiter();
        let route = policy(10, 5);
        let c = consumer("svc-a", 3, 2);

        let first = limiter.check(Some(("r", &route)), "ip", Some(&c)).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.reported.scope, LimitScope::Consumer);
        assert_eq!(first.reported.remaining, 1);

        assert!(limiter.check(Some(("r", &route)), "ip", Some(&c)).await.unwrap().allowed);

        let third = limiter.check(Some(("r", &route)), "ip", Some(&c)).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.reported.scope, LimitScope::Consumer);
        assert_eq!(third.reported.limit, 3);
        assert!(third.reported.retry_after_secs >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_only_limit() {
        let limiter = limiter();
        let c = consumer("svc-b", 2, 1);
        let outcome = limiter.check(None, "ip", Some(&c)).await.unwrap();
        assert_eq!(outcome.reported.scope, LimitScope::Consumer);
        assert!(!limiter.check(None, "ip", Some(&c)).await.unwrap().allowed);
    }

    #[test]
    fn test_combine_reports_lower_remaining_when_both_allow() {
        let d = |scope, remaining| ScopeDecision {
            scope,
            allowed: true,
            limit: 1,
            remaining,
            reset_after_secs: 0,
            retry_after_secs: 1,
            degraded: false,
        };
        let outcome =
            RateLimitOutcome::combine(Some(d(LimitScope::Route, 1)), Some(d(LimitScope::Consumer, 4)))
                .unwrap();
        assert_eq!(outcome.reported.scope, LimitScope::Route);

        let tie =
            RateLimitOutcome::combine(Some(d(LimitScope::Route, 2)), Some(d(LimitScope::Consumer, 2)))
                .unwrap();
        assert_eq!(tie.reported.scope, LimitScope::Consumer);
    }

    #[test]
    fn test_combine_is_degraded_when_any_scope_fell_back() {
        let route = ScopeDecision {
            scope: LimitScope::Route,
            allowed: true,
            limit: 5,
            remaining: 1,
            reset_after_secs: 1,
            retry_after_secs: 1,
            degraded: true,
        };
        let consumer = ScopeDecision {
            scope: LimitScope::Consumer,
            remaining: 3,
            degraded: false,
            ..route.clone()
        };

        // Route is reported (fewer tokens left) and carries the flag.
        let outcome = RateLimitOutcome::combine(Some(route.clone()), Some(consumer.clone())).unwrap();
        assert_eq!(outcome.reported.scope, LimitScope::Route);
        assert!(outcome.degraded);

        // Consumer is reported but the route scope still fell back.
        let route = ScopeDecision { remaining: 4, ..route };
        let outcome = RateLimitOutcome::combine(Some(route), Some(consumer)).unwrap();
        assert_eq!(outcome.reported.scope, LimitScope::Consumer);
        assert!(!outcome.reported.degraded);
        assert!(outcome.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_falls_back_to_reduced_local_limit() {
        let limiter = DistributedRateLimiter::new(Arc::new(FailingStore), &config());
        let p = policy(10, 4);

        let mut allowed = 0;
        for _ in 0..10 {
            let outcome = limiter.check(Some(("r", &p)), "ip", None).await.unwrap();
            assert!(outcome.degraded);
            if outcome.allowed {
                allowed += 1;
            }
        }
        // burst 4 scaled by the default factor 0.5
        assert_eq!(allowed, 2);
        assert!(limiter.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_falls_back() {
        let limiter = DistributedRateLimiter::new(Arc::new(HangingStore), &config());
        let p = policy(10, 10);
        let outcome = limiter.check(Some(("r", &p)), "ip", None).await.unwrap();
        assert!(outcome.allowed);
        assert!(outcome.degraded);
        assert_eq!(outcome.reported.limit, 5);
    }

    #[test]
    fn test_headers_and_error() {
        let outcome = RateLimitOutcome {
            allowed: false,
            degraded: false,
            reported: ScopeDecision {
                scope: LimitScope::Consumer,
                allowed: false,
                limit: 3,
                remaining: 0,
                reset_after_secs: 1,
                retry_after_secs: 1,
                degraded: false,
            },
        };
        let mut response = GatewayResponse::empty(axum::http::StatusCode::TOO_MANY_REQUESTS);
        outcome.apply_headers(&mut response);

        assert_eq!(response.header(HEADER_LIMIT), Some("3"));
        assert_eq!(response.header(HEADER_REMAINING), Some("0"));
        assert_eq!(response.header(HEADER_TYPE), Some("consumer"));
        assert_eq!(response.header(HEADER_RETRY_AFTER), Some("1"));
        assert!(matches!(outcome.to_error(), GatewayError::RateLimited { limit: 3, .. }));
    }

    #[test]
    fn test_bucket_keys() {
        let limiter = limiter();
        assert_eq!(limiter.route_key("orders", "10.0.0.1"), "gateway:ratelimit:route:orders:10.0.0.1");
        assert_eq!(limiter.consumer_key("svc-a"), "gateway:ratelimit:consumer:svc-a");
    }
}
