//! # HTTP Server Module
//!
//! Two axum applications on separate ports:
//!
//! - the **gateway** app sends every request, whatever its method or path, through
//!   the stage pipeline
//! - the **admin** app serves health, readiness, Prometheus metrics and the route
//!   cache endpoints
//!
//! `GatewayServer::from_config` wires the whole runtime: state store, rate limiter,
//! route source and cache, invalidation listeners, token validator and dispatcher.
//! Background tasks are owned by the server and aborted when it stops.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` for sharing the pipeline and cache across connections
//! - axum's `State` extractor and `fallback` handler for a catch-all proxy route
//! - `tokio::sync::watch` to fan one shutdown signal out to both listeners

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusHandle;
use notify::RecommendedWatcher;
use serde_json::json;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::jwt::TokenValidator;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::problem::ProblemFormatter;
use crate::core::types::GatewayRequest;
use crate::gateway::upstream::HttpDispatcher;
use crate::middleware::{
    AuthenticationStage, ConsumerIdentityStage, CorrelationStage, Dispatcher, MetricsStage,
    Pipeline, RateLimitStage, RequestLoggingStage, RouteLookupStage,
};
use crate::routing::cache::{RouteCache, SnapshotSummary};
use crate::routing::invalidation::{spawn_redis_listener, InvalidationBus, InvalidationEvent};
use crate::routing::source::build_route_source;
use crate::traffic::rate_limiter::DistributedRateLimiter;
use crate::traffic::store::{InMemoryStateStore, RedisStateStore, StateStore};

/// How often idle in-process buckets are purged
const BUCKET_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Assemble the stage pipeline from configuration and runtime components
pub fn build_pipeline(
    config: &GatewayConfig,
    cache: Arc<RouteCache>,
    validator: Arc<TokenValidator>,
    limiter: Arc<DistributedRateLimiter>,
    dispatcher: Arc<dyn Dispatcher>,
) -> Pipeline {
    let mut pipeline = Pipeline::new(
        dispatcher,
        ProblemFormatter::new(config.errors.type_base_uri.clone()),
    )
    .with_stage(Arc::new(CorrelationStage::new()))
    .with_stage(Arc::new(RouteLookupStage::new(cache)))
    .with_stage(Arc::new(AuthenticationStage::new(
        validator,
        config.auth.required_by_default,
    )))
    .with_stage(Arc::new(ConsumerIdentityStage::new()))
    .with_stage(Arc::new(RequestLoggingStage::new()));

    if config.rate_limiting.enabled {
        pipeline = pipeline.with_stage(Arc::new(RateLimitStage::new(limiter)));
    }
    if config.observability.metrics_enabled {
        pipeline = pipeline.with_stage(Arc::new(MetricsStage::new()));
    }
    pipeline
}

/// State of the proxying application
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub pipeline: Arc<Pipeline>,
    pub max_request_size: usize,
}

/// State of the admin application
#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<RouteCache>,
    pub bus: InvalidationBus,
    pub prometheus: Option<PrometheusHandle>,
}

/// Catch-all gateway router
pub fn build_gateway_app(state: GatewayState) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Admin router
pub fn build_admin_app(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/admin/routes", get(list_routes))
        .route("/admin/routes/refresh", post(refresh_routes))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new()),
        )
}

fn declared_length(request: &GatewayRequest) -> Option<usize> {
    request
        .header(header::CONTENT_LENGTH.as_str())
        .and_then(|value| value.trim().parse().ok())
}

/// Buffer the body within the size limit and run the pipeline
async fn handle_request(State(state): State<GatewayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let mut gateway_request =
        GatewayRequest::new(parts.method, parts.uri, parts.headers, Bytes::new(), remote_addr);
    let too_large = GatewayError::PayloadTooLarge {
        limit: state.max_request_size,
    };

    if declared_length(&gateway_request).is_some_and(|len| len > state.max_request_size) {
        return state
            .pipeline
            .reject(&gateway_request, too_large)
            .await
            .into_response();
    }

    match axum::body::to_bytes(body, state.max_request_size).await {
        Ok(bytes) => gateway_request.body = bytes,
        Err(e) => {
            debug!(error = %e, "Failed to buffer request body");
            return state
                .pipeline
                .reject(&gateway_request, too_large)
                .await
                .into_response();
        }
    }

    state.pipeline.handle(gateway_request).await.into_response()
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// 200 once a route snapshot has been loaded, 503 before
async fn readiness_check(State(state): State<AdminState>) -> Response {
    if state.cache.is_ready() {
        let snapshot = state.cache.snapshot();
        (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "generation": snapshot.generation(),
                "routes": snapshot.route_count(),
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "reason": "route snapshot not loaded",
            })),
        )
            .into_response()
    }
}

async fn metrics_endpoint(State(state): State<AdminState>) -> Response {
    match state.prometheus.as_ref() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_routes(State(state): State<AdminState>) -> Json<SnapshotSummary> {
    Json(state.cache.snapshot().summary())
}

/// Queue a full refresh through the local invalidation bus
async fn refresh_routes(State(state): State<AdminState>) -> impl IntoResponse {
    let receivers = state.bus.publish(InvalidationEvent::All);
    info!(receivers, "Route refresh requested via admin API");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "receivers": receivers })),
    )
}

/// The assembled gateway runtime
pub struct GatewayServer {
    config: GatewayConfig,
    pipeline: Arc<Pipeline>,
    cache: Arc<RouteCache>,
    bus: InvalidationBus,
    prometheus: Option<PrometheusHandle>,
    _route_watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    /// Build every component and start the background tasks
    ///
    /// A failing initial route load is not fatal: the gateway starts not-ready and the
    /// maintenance loop keeps retrying.
    pub async fn from_config(
        config: GatewayConfig,
        prometheus: Option<PrometheusHandle>,
    ) -> GatewayResult<Self> {
        let bus = InvalidationBus::new();
        let mut tasks = Vec::new();

        let redis_client = if config.redis.enabled {
            Some(redis::Client::open(config.redis.url.as_str())?)
        } else {
            None
        };

        let store: Arc<dyn StateStore> = match redis_client.as_ref() {
            Some(client) => Arc::new(RedisStateStore::connect(client.clone()).await) as Arc<dyn StateStore>,
            None => {
                info!("Redis disabled, rate limits are enforced per instance");
                let memory = Arc::new(InMemoryStateStore::new());
                tasks.push(Arc::clone(&memory).spawn_janitor(BUCKET_JANITOR_INTERVAL));
                memory as Arc<dyn StateStore>
            }
        };
        let limiter = Arc::new(DistributedRateLimiter::new(store, &config.rate_limiting));
        tasks.push(limiter.fallback_store().spawn_janitor(BUCKET_JANITOR_INTERVAL));

        if let Some(client) = redis_client {
            tasks.push(spawn_redis_listener(
                client,
                config.redis.invalidation_channel.clone(),
                bus.clone(),
            ));
        }

        let (source, route_watcher) = build_route_source(&config.route_source, &bus)?;
        let cache = Arc::new(RouteCache::new(source));
        if let Err(e) = cache.refresh().await {
            warn!(error = %e, "Initial route load failed, gateway is not ready yet");
        }
        tasks.push(
            Arc::clone(&cache).spawn_maintenance(bus.subscribe(), config.route_cache.refresh_interval),
        );

        let validator = Arc::new(TokenValidator::from_config(&config.auth).await?);
        if let Some(handle) = Arc::clone(&validator).spawn_jwks_refresh(config.auth.jwks_refresh_interval) {
            tasks.push(handle);
        }

        let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new(&config.upstream)?);
        let pipeline = Arc::new(build_pipeline(
            &config,
            Arc::clone(&cache),
            validator,
            limiter,
            dispatcher,
        ));
        info!(stages = ?pipeline.stage_names(), "Request pipeline assembled");

        Ok(Self {
            config,
            pipeline,
            cache,
            bus,
            prometheus,
            _route_watcher: route_watcher,
            tasks,
        })
    }

    pub fn gateway_app(&self) -> Router {
        build_gateway_app(GatewayState {
            pipeline: Arc::clone(&self.pipeline),
            max_request_size: self.config.server.max_request_size,
        })
    }

    pub fn admin_app(&self) -> Router {
        build_admin_app(AdminState {
            cache: Arc::clone(&self.cache),
            bus: self.bus.clone(),
            prometheus: self.prometheus.clone(),
        })
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> GatewayResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve both apps until `shutdown` completes, then drain in-flight requests
    pub async fn run_until<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let server = &self.config.server;
        let gateway_addr = format!("{}:{}", server.bind_address, server.gateway_port);
        let admin_addr = format!("{}:{}", server.bind_address, server.admin_port);

        let gateway_listener = TcpListener::bind(&gateway_addr).await.map_err(|e| {
            GatewayError::config(format!("Failed to bind gateway server to {}: {}", gateway_addr, e))
        })?;
        let admin_listener = TcpListener::bind(&admin_addr).await.map_err(|e| {
            GatewayError::config(format!("Failed to bind admin server to {}: {}", admin_addr, e))
        })?;
        info!(gateway = %gateway_addr, admin = %admin_addr, "Gateway listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = shutdown_tx.send(true);
        });

        let gateway = axum::serve(
            gateway_listener,
            self.gateway_app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
        .into_future();
        let admin = axum::serve(admin_listener, self.admin_app())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .into_future();

        let result = tokio::try_join!(gateway, admin);

        for task in &self.tasks {
            task.abort();
        }
        result.map_err(|e| GatewayError::internal(format!("Server error: {}", e)))?;

        info!("Gateway stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
