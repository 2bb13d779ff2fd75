//! # Route Cache
//!
//! Serves path → route lookups from an immutable [`RouteSnapshot`] with no I/O on the
//! request path. A refresh reads the whole catalog, builds a new snapshot off to the
//! side and publishes it with a single pointer swap, so a reader sees either the old
//! snapshot or the new one and never a mix.
//!
//! ## Matching
//! Lookup walks the request path's segment prefixes from longest to shortest. A route
//! matches when its path equals the request path or is followed by `/` in it, so
//! `/api/orders` matches `/api/orders/123` but never `/api/ordershistory`. A route
//! whose method set excludes the request method is skipped and shorter prefixes are
//! tried.
//!
//! ## Rust Concepts Used
//! - `ArcSwap` for lock-free reads of the current snapshot
//! - `tokio::sync::Mutex` to keep refreshes single-writer
//! - `tokio::select!` to combine pub/sub invalidations with a periodic tick

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::error::GatewayResult;
use crate::observability::metrics;
use crate::routing::invalidation::InvalidationEvent;
use crate::routing::route::{
    normalize_route_path, ConsumerRateLimit, RateLimitPolicy, Route, RouteCatalog, RouteStatus,
};
use crate::routing::source::RouteSource;

/// Immutable view of all published routes and the policies they reference
#[derive(Debug)]
pub struct RouteSnapshot {
    /// Normalized route path → routes registered on it, in catalog order
    routes: HashMap<String, Vec<Arc<Route>>>,

    policies: HashMap<String, RateLimitPolicy>,

    consumer_limits: HashMap<String, ConsumerRateLimit>,

    /// Monotonically increasing per cache; 0 is the empty startup snapshot
    generation: u64,

    loaded_at: DateTime<Utc>,
}

impl RouteSnapshot {
    /// Snapshot with no routes, used until the first refresh succeeds
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
            policies: HashMap::new(),
            consumer_limits: HashMap::new(),
            generation: 0,
            loaded_at: Utc::now(),
        }
    }

    /// Build a snapshot from a catalog, dropping every route that is not published
    pub fn build(catalog: RouteCatalog, generation: u64) -> Self {
        let mut routes: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        for route in catalog
            .routes
            .into_iter()
            .filter(|route| route.status == RouteStatus::Published)
        {
            routes
                .entry(normalize_route_path(&route.path))
                .or_default()
                .push(Arc::new(route));
        }

        let policies = catalog
            .rate_limit_policies
            .into_iter()
            .map(|policy| (policy.id.clone(), policy))
            .collect();

        let consumer_limits = catalog
            .consumer_rate_limits
            .into_iter()
            .map(|limit| (limit.consumer_id.clone(), limit))
            .collect();

        Self {
            routes,
            policies,
            consumer_limits,
            generation,
            loaded_at: Utc::now(),
        }
    }

    /// Longest-prefix match on segment boundaries
    pub fn lookup(&self, method: &str, path: &str) -> Option<Arc<Route>> {
        let mut candidate = path;
        loop {
            if let Some(routes) = self.routes.get(candidate) {
                if let Some(route) = routes.iter().find(|route| route.allows_method(method)) {
                    return Some(Arc::clone(route));
                }
            }
            if candidate.is_empty() {
                return None;
            }
            candidate = match candidate.rfind('/') {
                Some(idx) => &candidate[..idx],
                None => "",
            };
        }
    }

    /// Route-level policy by id
    pub fn policy(&self, id: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(id)
    }

    /// Consumer-level limit by consumer id
    pub fn consumer_limit(&self, consumer_id: &str) -> Option<&ConsumerRateLimit> {
        self.consumer_limits.get(consumer_id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Number of routable routes
    pub fn route_count(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values().flatten()
    }

    /// Serializable summary for the admin API
    pub fn summary(&self) -> SnapshotSummary {
        let mut routes: Vec<RouteSummary> = self
            .routes()
            .map(|route| RouteSummary {
                id: route.id.clone(),
                path: route.path.clone(),
                methods: route.methods.iter().cloned().collect(),
                rate_limit_id: route.rate_limit_id.clone(),
            })
            .collect();
        routes.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.id.cmp(&b.id)));

        SnapshotSummary {
            generation: self.generation,
            loaded_at: self.loaded_at,
            route_count: routes.len(),
            policy_count: self.policies.len(),
            consumer_limit_count: self.consumer_limits.len(),
            routes,
        }
    }
}

/// Admin view of a snapshot
///
/// Upstream URLs are deliberately left out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
    pub route_count: usize,
    pub policy_count: usize,
    pub consumer_limit_count: usize,
    pub routes: Vec<RouteSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub id: String,
    pub path: String,
    pub methods: Vec<String>,
    pub rate_limit_id: Option<String>,
}

/// Hot-reloadable route cache
#[derive(Debug)]
pub struct RouteCache {
    current: ArcSwap<RouteSnapshot>,
    source: Arc<dyn RouteSource>,
    refresh_lock: tokio::sync::Mutex<()>,
    loaded: AtomicBool,
}

impl RouteCache {
    /// Create a cache holding the empty snapshot; call [`RouteCache::refresh`] to load
    pub fn new(source: Arc<dyn RouteSource>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteSnapshot::empty()),
            source,
            refresh_lock: tokio::sync::Mutex::new(()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Current snapshot; hold on to it to get consistent route and policy reads
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    pub fn lookup(&self, method: &str, path: &str) -> Option<Arc<Route>> {
        self.current.load().lookup(method, path)
    }

    /// Whether at least one refresh has succeeded
    pub fn is_ready(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Reload the catalog and swap in a new snapshot
    ///
    /// Refreshes are serialized. On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> GatewayResult<Arc<RouteSnapshot>> {
        let _guard = self.refresh_lock.lock().await;

        let catalog = match self.source.load().await {
            Ok(catalog) => catalog,
            Err(e) => {
                metrics::record_route_cache_refresh("failure");
                warn!(
                    source = self.source.name(),
                    error = %e,
                    generation = self.current.load().generation,
                    "Route refresh failed, keeping previous snapshot"
                );
                return Err(e);
            }
        };

        let generation = self.current.load().generation + 1;
        let snapshot = Arc::new(RouteSnapshot::build(catalog, generation));
        self.current.store(Arc::clone(&snapshot));
        self.loaded.store(true, Ordering::Release);

        metrics::record_route_cache_refresh("success");
        metrics::record_route_cache_state(snapshot.route_count(), generation);
        info!(
            source = self.source.name(),
            generation,
            routes = snapshot.route_count(),
            "Route snapshot swapped"
        );
        Ok(snapshot)
    }

    /// Keep the cache fresh: refresh on every invalidation and on a fixed interval
    ///
    /// Bursts of invalidations are coalesced into one refresh. A lagged receiver also
    /// triggers a refresh since the missed events cannot be recovered.
    pub fn spawn_maintenance(
        self: Arc<Self>,
        mut invalidations: broadcast::Receiver<InvalidationEvent>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut bus_open = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Periodic route refresh");
                    }
                    event = invalidations.recv(), if bus_open => {
                        match event {
                            Ok(event) => debug!(?event, "Route invalidation"),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Route invalidations lagged, refreshing");
                            }
                            Err(RecvError::Closed) => {
                                bus_open = false;
                                continue;
                            }
                        }
                        loop {
                            match invalidations.try_recv() {
                                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                                Err(TryRecvError::Empty) => break,
                                Err(TryRecvError::Closed) => {
                                    bus_open = false;
                                    break;
                                }
                            }
                        }
                    }
                }

                // Failures are logged inside refresh; the previous snapshot stays live.
                let _ = self.refresh().await;
            }
        })
    }
}
