//! # Route Sources
//!
//! A [`RouteSource`] performs the bulk read of routes and policies that feeds a cache
//! refresh. Sources return everything they have; filtering to published routes is
//! done when the snapshot is built.
//!
//! ## Implementations
//! - [`StaticRouteSource`]: in-memory catalog, replaceable at runtime (config and tests)
//! - [`FileRouteSource`]: YAML/JSON/TOML file, optionally watched with `notify`
//! - [`HttpRouteSource`]: control-plane endpoint returning the catalog as JSON

use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::{ConfigFormat, RouteSourceConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::invalidation::{InvalidationBus, InvalidationEvent};
use crate::routing::route::RouteCatalog;

/// Bulk reader of the route catalog
#[async_trait]
pub trait RouteSource: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Read every route, policy and consumer limit
    async fn load(&self) -> GatewayResult<RouteCatalog>;
}

/// Catalog held in memory
#[derive(Debug, Default)]
pub struct StaticRouteSource {
    catalog: RwLock<RouteCatalog>,
}

impl StaticRouteSource {
    pub fn new(catalog: RouteCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
        }
    }

    /// Swap the catalog; takes effect on the next cache refresh
    pub fn replace(&self, catalog: RouteCatalog) {
        *self.catalog.write() = catalog;
    }
}

#[async_trait]
impl RouteSource for StaticRouteSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn load(&self) -> GatewayResult<RouteCatalog> {
        Ok(self.catalog.read().clone())
    }
}

/// Catalog read from a file on every refresh
#[derive(Debug)]
pub struct FileRouteSource {
    path: PathBuf,
}

impl FileRouteSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish [`InvalidationEvent::All`] whenever the file is written or replaced
    ///
    /// The parent directory is watched rather than the file so editors that write a
    /// temp file and rename it are still picked up. The returned watcher must be kept
    /// alive for events to keep flowing.
    pub fn watch(&self, bus: InvalidationBus) -> GatewayResult<RecommendedWatcher> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| GatewayError::config("Invalid route file path"))?
            .to_owned();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if event
                .paths
                .iter()
                .any(|path| path.file_name() == Some(file_name.as_os_str()))
            {
                debug!("Route file changed");
                bus.publish(InvalidationEvent::All);
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create route file watcher: {}", e)))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch route directory: {}", e)))?;

        info!(path = %self.path.display(), "Watching route file");
        Ok(watcher)
    }
}

#[async_trait]
impl RouteSource for FileRouteSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self) -> GatewayResult<RouteCatalog> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::route_source(format!(
                "Failed to read route file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let catalog = match ConfigFormat::from_path(&self.path) {
            ConfigFormat::Json => serde_json::from_str(&content)
                .map_err(|e| GatewayError::route_source(format!("Invalid route file: {}", e)))?,
            ConfigFormat::Toml => toml::from_str(&content)
                .map_err(|e| GatewayError::route_source(format!("Invalid route file: {}", e)))?,
            ConfigFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::route_source(format!("Invalid route file: {}", e)))?,
        };
        Ok(catalog)
    }
}

/// Catalog fetched from the control plane
#[derive(Debug)]
pub struct HttpRouteSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRouteSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build route source client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RouteSource for HttpRouteSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn load(&self) -> GatewayResult<RouteCatalog> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| GatewayError::route_source(format!("Route catalog request failed: {}", e)))?;

        response
            .json::<RouteCatalog>()
            .await
            .map_err(|e| GatewayError::route_source(format!("Invalid route catalog: {}", e)))
    }
}

/// Build the configured source
///
/// File sources with `watch: true` also get a watcher that publishes to `bus`; it is
/// returned so the caller can keep it alive.
pub fn build_route_source(
    config: &RouteSourceConfig,
    bus: &InvalidationBus,
) -> GatewayResult<(Arc<dyn RouteSource>, Option<RecommendedWatcher>)> {
    match config {
        RouteSourceConfig::Static { catalog } => {
            Ok((Arc::new(StaticRouteSource::new(catalog.clone())), None))
        }
        RouteSourceConfig::File { path, watch } => {
            let source = FileRouteSource::new(path.clone());
            let watcher = if *watch {
                match source.watch(bus.clone()) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        warn!(error = %e, "Route file watch unavailable, relying on periodic refresh");
                        None
                    }
                }
            } else {
                None
            };
            Ok((Arc::new(source), watcher))
        }
        RouteSourceConfig::Http { url, timeout } => {
            Ok((Arc::new(HttpRouteSource::new(url.clone(), *timeout)?), None))
        }
    }
}
