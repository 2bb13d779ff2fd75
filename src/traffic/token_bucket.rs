//! # Token Bucket
//!
//! Pure token-bucket arithmetic shared by every state store. The Redis store runs the
//! same steps inside a Lua script; the in-process store calls [`take`] directly.
//!
//! On each check: `tokens = min(burst, tokens + elapsed * rate)`, then one token is
//! taken if at least one is available. A bucket that does not exist yet starts full.

use std::time::Duration;

/// Refill rate and capacity of a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Tokens added per second
    pub rate: f64,

    /// Capacity
    pub burst: f64,
}

impl BucketSpec {
    /// Build from policy values; a zero rate is raised to one token per second
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            rate: f64::from(requests_per_second.max(1)),
            burst: f64::from(burst_size),
        }
    }

    /// Reduced bucket used while the shared store is unavailable
    ///
    /// Rate and burst are multiplied by `factor` and never drop below one.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            rate: (self.rate * factor).max(1.0),
            burst: (self.burst * factor).floor().max(1.0),
        }
    }

    /// Idle time after which an untouched bucket would be full again, plus one second
    ///
    /// Used as the store TTL so an expired bucket is indistinguishable from a full one.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs((self.burst / self.rate).ceil() as u64 + 1)
    }

    /// Whole requests the bucket admits per second, for the limit header
    pub fn limit(&self) -> u32 {
        self.rate.floor() as u32
    }

    /// Seconds until the bucket is full again
    pub fn reset_after_secs(&self, tokens: f64) -> u64 {
        ((self.burst - tokens).max(0.0) / self.rate).ceil() as u64
    }

    /// Seconds until at least one token is available, never less than one
    pub fn retry_after_secs(&self, tokens: f64) -> u64 {
        (((1.0 - tokens).max(0.0) / self.rate).ceil() as u64).max(1)
    }
}

/// Persisted bucket state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Fractional token count in `[0, burst]`
    pub tokens: f64,

    /// Time of the last refill, in seconds on the store's clock
    pub last_refill: f64,
}

/// Result of one check-and-decrement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,

    /// Tokens left after this request
    pub tokens: f64,
}

impl Decision {
    /// Whole tokens left, for the remaining header
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }
}

/// Refill, then try to take one token
pub fn take(spec: &BucketSpec, state: Option<BucketState>, now: f64) -> (Decision, BucketState) {
    let (tokens, last_refill) = match state {
        Some(state) => (state.tokens, state.last_refill),
        None => (spec.burst, now),
    };

    let elapsed = (now - last_refill).max(0.0);
    let mut tokens = (tokens + elapsed * spec.rate).min(spec.burst).max(0.0);

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    (
        Decision { allowed, tokens },
        BucketState {
            tokens,
            last_refill: now,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_deny() {
        let spec = BucketSpec::new(5, 3);
        let mut state = None;
        let mut allowed = 0;
        for _ in 0..10 {
            let (decision, next) = take(&spec, state, 100.0);
            state = Some(next);
            if decision.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_refill_is_clamped_to_burst() {
        let spec = BucketSpec::new(5, 3);
        let empty = BucketState {
            tokens: 0.0,
            last_refill: 0.0,
        };

        let (decision, _) = take(&spec, Some(empty), 1.1);
        assert!(decision.allowed);
        assert_eq!(decision.remaining(), 2);

        let (partial, _) = take(&spec, Some(empty), 0.1);
        assert!(!partial.allowed);
        assert!((partial.tokens - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clock_going_backwards_does_not_add_tokens() {
        let spec = BucketSpec::new(10, 2);
        let state = BucketState {
            tokens: 0.2,
            last_refill: 50.0,
        };
        let (decision, next) = take(&spec, Some(state), 40.0);
        assert!(!decision.allowed);
        assert!((next.tokens - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_header_arithmetic() {
        let spec = BucketSpec::new(2, 10);
        assert_eq!(spec.limit(), 2);
        assert_eq!(spec.reset_after_secs(4.0), 3);
        assert_eq!(spec.reset_after_secs(10.0), 0);
        assert_eq!(spec.retry_after_secs(0.0), 1);
        assert_eq!(spec.retry_after_secs(0.9), 1);

        let slow = BucketSpec::new(1, 1);
        assert_eq!(slow.retry_after_secs(0.0), 1);
        assert_eq!(BucketSpec::new(1, 5).reset_after_secs(0.0), 5);
    }

    #[test]
    fn test_ttl_covers_full_refill() {
        assert_eq!(BucketSpec::new(5, 3).ttl(), Duration::from_secs(2));
        assert_eq!(BucketSpec::new(1, 60).ttl(), Duration::from_secs(61));
    }

    #[test]
    fn test_scaled_spec_has_floor_of_one() {
        let spec = BucketSpec::new(10, 5).scaled(0.5);
        assert_eq!(spec.rate, 5.0);
        assert_eq!(spec.burst, 2.0);

        let tiny = BucketSpec::new(1, 1).scaled(0.1);
        assert_eq!(tiny.rate, 1.0);
        assert_eq!(tiny.burst, 1.0);
    }
}
