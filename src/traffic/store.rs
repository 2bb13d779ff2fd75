//! # Shared State Store
//!
//! Rate-limit buckets live in a shared key-value store so every gateway instance
//! draws from the same tokens. The check-and-decrement must be one indivisible store
//! operation; with Redis that is a Lua script evaluated server side, using the
//! server's clock so instances with skewed clocks still agree.
//!
//! [`InMemoryStateStore`] implements the same contract inside the process. It is used
//! when no Redis is configured and as the degraded-mode fallback of the limiter.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::error::GatewayError;
use crate::traffic::token_bucket::{self, BucketSpec, BucketState, Decision};

/// Errors from a state store round trip
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected store reply: {0}")]
    Decode(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::state_store(err.to_string())
    }
}

/// Atomic token-bucket storage
#[async_trait]
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Short name for logs and metrics
    fn name(&self) -> &str;

    /// Refill the bucket at `key`, take one token if possible, persist, and report
    async fn take_token(&self, key: &str, spec: &BucketSpec) -> Result<Decision, StoreError>;
}

/// Token bucket in a Redis hash: `tokens` and `ts` fields, TTL refreshed on each hit
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

if redis.replicate_commands then
  redis.replicate_commands()
end

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = burst
  ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(burst, tokens + elapsed * rate)

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('EXPIRE', key, ttl)
return { allowed, tostring(tokens) }
"#;

/// Redis-backed store using a managed, auto-reconnecting connection
///
/// The connection is established lazily, so a Redis outage at startup only puts the
/// limiter into fallback mode until the first successful connect.
#[derive(Clone)]
pub struct RedisStateStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    script: Arc<redis::Script>,
}

impl fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStateStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
            script: Arc::new(redis::Script::new(TOKEN_BUCKET_SCRIPT)),
        }
    }

    /// Create the store and try to connect right away
    pub async fn connect(client: redis::Client) -> Self {
        let store = Self::new(client);
        match store.connection().await {
            Ok(_) => info!("Connected rate-limit state store to Redis"),
            Err(e) => warn!(error = %e, "Redis unavailable at startup, will retry on demand"),
        }
        store
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn take_token(&self, key: &str, spec: &BucketSpec) -> Result<Decision, StoreError> {
        let mut conn = self.connection().await?;
        let (allowed, tokens): (i64, String) = self
            .script
            .key(key)
            .arg(spec.rate)
            .arg(spec.burst)
            .arg(spec.ttl().as_secs())
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens
            .parse::<f64>()
            .map_err(|_| StoreError::Decode(format!("token count {:?}", tokens)))?;

        Ok(Decision {
            allowed: allowed == 1,
            tokens,
        })
    }
}

/// In-process store; state is per instance and lost on restart
#[derive(Debug)]
pub struct InMemoryStateStore {
    buckets: DashMap<String, StoredBucket>,
    origin: Instant,
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: Instant,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            origin: Instant::now(),
        }
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets whose TTL has passed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        before.saturating_sub(self.buckets.len())
    }

    /// Periodically purge expired buckets
    pub fn spawn_janitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged idle rate-limit buckets");
                }
            }
        })
    }

    /// Synchronous check-and-decrement; the DashMap entry lock makes it atomic per key
    pub fn take_token_now(&self, key: &str, spec: &BucketSpec) -> Decision {
        let now = Instant::now();
        let now_secs = now.duration_since(self.origin).as_secs_f64();

        let mut entry = self.buckets.entry(key.to_string()).or_insert(StoredBucket {
            state: BucketState {
                tokens: spec.burst,
                last_refill: now_secs,
            },
            expires_at: now,
        });

        let previous = (entry.expires_at > now).then_some(entry.state);
        let (decision, state) = token_bucket::take(spec, previous, now_secs);
        *entry = StoredBucket {
            state,
            expires_at: now + spec.ttl(),
        };
        decision
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn take_token(&self, key: &str, spec: &BucketSpec) -> Result<Decision, StoreError> {
        Ok(self.take_token_now(key, spec))
    }
}
