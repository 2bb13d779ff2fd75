//! # Configuration Module
//!
//! Static configuration for the gateway runtime. Routes and rate-limit policies are
//! *not* part of this file in production; they come from the route source and are
//! hot-reloaded by the route cache. The `static` route source exists for local runs
//! and tests.
//!
//! ## Key Features
//! - YAML, JSON or TOML parsing with serde, chosen by file extension
//! - Human-readable durations (`"250ms"`, `"30s"`) via `humantime_serde`
//! - Environment variable overrides following `GATEWAY_<SECTION>_<FIELD>`
//! - Validation that collects every problem before failing

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::route::RouteCatalog;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration
    pub server: ServerConfig,

    /// Upstream dispatch timeouts
    pub upstream: UpstreamConfig,

    /// Bearer-token validation
    pub auth: AuthConfig,

    /// Distributed rate limiter
    pub rate_limiting: RateLimitingConfig,

    /// Shared state store connection
    pub redis: RedisConfig,

    /// Where published routes and policies are read from
    pub route_source: RouteSourceConfig,

    /// Route cache refresh behaviour
    pub route_cache: RouteCacheConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,

    /// Problem-details rendering
    pub errors: ErrorFormatConfig,
}

impl GatewayConfig {
    /// Load configuration from a file, apply environment overrides and validate
    ///
    /// The format is picked from the extension: `.json`, `.toml`, anything else is YAML.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::parse(&content, ConfigFormat::from_path(path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text without overrides or validation
    pub fn parse(content: &str, format: ConfigFormat) -> GatewayResult<Self> {
        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse YAML config: {}", e))),
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e))),
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse TOML config: {}", e))),
        }
    }

    /// Apply `GATEWAY_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup function
    ///
    /// Environment variables follow the pattern `GATEWAY_<SECTION>_<FIELD>`,
    /// for example `GATEWAY_SERVER_GATEWAY_PORT=8080`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(port) = lookup("GATEWAY_SERVER_GATEWAY_PORT") {
            self.server.gateway_port = parse_override("GATEWAY_SERVER_GATEWAY_PORT", &port)?;
        }
        if let Some(port) = lookup("GATEWAY_SERVER_ADMIN_PORT") {
            self.server.admin_port = parse_override("GATEWAY_SERVER_ADMIN_PORT", &port)?;
        }
        if let Some(size) = lookup("GATEWAY_SERVER_MAX_REQUEST_SIZE") {
            self.server.max_request_size = parse_override("GATEWAY_SERVER_MAX_REQUEST_SIZE", &size)?;
        }

        if let Some(timeout) = lookup("GATEWAY_UPSTREAM_CONNECT_TIMEOUT") {
            self.upstream.connect_timeout =
                parse_duration_override("GATEWAY_UPSTREAM_CONNECT_TIMEOUT", &timeout)?;
        }
        if let Some(timeout) = lookup("GATEWAY_UPSTREAM_RESPONSE_TIMEOUT") {
            self.upstream.response_timeout =
                parse_duration_override("GATEWAY_UPSTREAM_RESPONSE_TIMEOUT", &timeout)?;
        }

        if let Some(secret) = lookup("GATEWAY_AUTH_HMAC_SECRET") {
            self.auth.hmac_secret = Some(secret);
        }
        if let Some(url) = lookup("GATEWAY_AUTH_JWKS_URL") {
            self.auth.jwks_url = Some(url);
        }
        if let Some(issuer) = lookup("GATEWAY_AUTH_ISSUER") {
            self.auth.issuer = Some(issuer);
        }

        if let Some(url) = lookup("GATEWAY_REDIS_URL") {
            self.redis.url = url;
            self.redis.enabled = true;
        }
        if let Some(enabled) = lookup("GATEWAY_REDIS_ENABLED") {
            self.redis.enabled = parse_override("GATEWAY_REDIS_ENABLED", &enabled)?;
        }

        if let Some(factor) = lookup("GATEWAY_RATE_LIMITING_LOCAL_LIMIT_FACTOR") {
            self.rate_limiting.local_limit_factor =
                parse_override("GATEWAY_RATE_LIMITING_LOCAL_LIMIT_FACTOR", &factor)?;
        }

        if let Some(interval) = lookup("GATEWAY_ROUTE_CACHE_REFRESH_INTERVAL") {
            self.route_cache.refresh_interval =
                parse_duration_override("GATEWAY_ROUTE_CACHE_REFRESH_INTERVAL", &interval)?;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.observability.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "pretty" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.gateway_port == 0 {
            errors.push("server.gateway_port must be greater than 0".to_string());
        }
        if self.server.admin_port == 0 {
            errors.push("server.admin_port must be greater than 0".to_string());
        }
        if self.server.gateway_port == self.server.admin_port {
            errors.push("server.gateway_port and server.admin_port must differ".to_string());
        }
        if self.server.max_request_size == 0 {
            errors.push("server.max_request_size must be greater than 0".to_string());
        }

        if self.upstream.connect_timeout.is_zero() {
            errors.push("upstream.connect_timeout must be greater than 0".to_string());
        }
        if self.upstream.response_timeout.is_zero() {
            errors.push("upstream.response_timeout must be greater than 0".to_string());
        }

        if self.auth.allowed_algorithms.is_empty() {
            errors.push("auth.allowed_algorithms cannot be empty".to_string());
        }
        if self.auth.required_by_default && !self.auth.has_key_source() {
            errors.push(
                "auth requires at least one of hmac_secret, public_key_files or jwks_url"
                    .to_string(),
            );
        }
        if let Some(ref jwks_url) = self.auth.jwks_url {
            if Url::parse(jwks_url).is_err() {
                errors.push(format!("auth.jwks_url is not a valid URL: {}", jwks_url));
            }
        }

        if self.rate_limiting.key_prefix.is_empty() {
            errors.push("rate_limiting.key_prefix cannot be empty".to_string());
        }
        if self.rate_limiting.store_timeout.is_zero() {
            errors.push("rate_limiting.store_timeout must be greater than 0".to_string());
        }
        let factor = self.rate_limiting.local_limit_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            errors.push(format!(
                "rate_limiting.local_limit_factor must be in (0, 1], got {}",
                factor
            ));
        }

        if self.redis.enabled {
            if Url::parse(&self.redis.url).is_err() {
                errors.push(format!("redis.url is not a valid URL: {}", self.redis.url));
            }
            if self.redis.invalidation_channel.is_empty() {
                errors.push("redis.invalidation_channel cannot be empty".to_string());
            }
        }

        match &self.route_source {
            RouteSourceConfig::Static { .. } => {}
            RouteSourceConfig::File { path, .. } => {
                if path.as_os_str().is_empty() {
                    errors.push("route_source.path cannot be empty".to_string());
                }
            }
            RouteSourceConfig::Http { url, timeout } => {
                if Url::parse(url).is_err() {
                    errors.push(format!("route_source.url is not a valid URL: {}", url));
                }
                if timeout.is_zero() {
                    errors.push("route_source.timeout must be greater than 0".to_string());
                }
            }
        }

        if self.route_cache.refresh_interval.is_zero() {
            errors.push("route_cache.refresh_interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_override<T>(key: &str, value: &str) -> GatewayResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
}

fn parse_duration_override(key: &str, value: &str) -> GatewayResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
}

/// Serialization format of a configuration or route file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind_address: String,

    /// Port serving proxied traffic
    pub gateway_port: u16,

    /// Port serving health, readiness, metrics and route admin endpoints
    pub admin_port: u16,

    /// Maximum buffered request body size in bytes
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            gateway_port: 8080,
            admin_port: 9090,
            max_request_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Upstream dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// TCP connect timeout; exceeding it maps to 504
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Total time allowed for the upstream response
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,

    /// How long idle pooled connections are kept
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Bearer-token validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether routes without an explicit `authRequired` need a token
    pub required_by_default: bool,

    /// Expected `iss` claim
    pub issuer: Option<String>,

    /// Accepted `aud` values; audience is not checked when empty
    pub audience: Vec<String>,

    /// Algorithms a token header may declare
    pub allowed_algorithms: Vec<Algorithm>,

    /// Clock skew tolerated for `exp` and `nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,

    /// Shared secret for HS* tokens
    pub hmac_secret: Option<String>,

    /// PEM encoded RSA or EC public keys
    pub public_key_files: Vec<PathBuf>,

    /// JSON Web Key Set published by the identity provider
    pub jwks_url: Option<String>,

    /// How often the key set is re-fetched
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
}

impl AuthConfig {
    /// Whether any key material is configured
    pub fn has_key_source(&self) -> bool {
        self.hmac_secret.is_some() || !self.public_key_files.is_empty() || self.jwks_url.is_some()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required_by_default: true,
            issuer: None,
            audience: Vec::new(),
            allowed_algorithms: vec![Algorithm::HS256, Algorithm::RS256, Algorithm::ES256],
            leeway: Duration::from_secs(30),
            hmac_secret: None,
            public_key_files: Vec::new(),
            jwks_url: None,
            jwks_refresh_interval: Duration::from_secs(300),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Disable to skip rate limiting entirely
    pub enabled: bool,

    /// Prefix for bucket keys in the state store
    pub key_prefix: String,

    /// Upper bound on a single store round trip before falling back
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// Scale applied to rate and burst when the local fallback bucket is used
    pub local_limit_factor: f64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "gateway:ratelimit".to_string(),
            store_timeout: Duration::from_millis(100),
            local_limit_factor: 0.5,
        }
    }
}

/// Shared state store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When disabled, rate limiting uses the in-process store and no pub/sub is used
    pub enabled: bool,

    /// Connection URL
    pub url: String,

    /// Pub/sub channel carrying route and policy invalidations
    pub invalidation_channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            invalidation_channel: "gateway:routes:invalidate".to_string(),
        }
    }
}

/// Where the route cache reads published routes and policies from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RouteSourceConfig {
    /// Catalog embedded in the configuration
    Static {
        #[serde(default)]
        catalog: RouteCatalog,
    },

    /// YAML/JSON catalog file, re-read on every refresh
    File {
        path: PathBuf,
        /// Publish an invalidation when the file changes
        #[serde(default)]
        watch: bool,
    },

    /// Control-plane endpoint returning the catalog as JSON
    Http {
        url: String,
        #[serde(default = "default_source_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RouteSourceConfig {
    fn default() -> Self {
        Self::Static {
            catalog: RouteCatalog::default(),
        }
    }
}

/// Route cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteCacheConfig {
    /// Periodic refresh, independent of pub/sub invalidation
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub log_level: String,

    pub log_format: LogFormat,

    /// Install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: true,
        }
    }
}

/// Problem-details rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorFormatConfig {
    /// Base URI that error slugs are appended to for the `type` member
    pub type_base_uri: String,
}

impl Default for ErrorFormatConfig {
    fn default() -> Self {
        Self {
            type_base_uri: "https://gateway.local/errors".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.auth.hmac_secret = Some("secret".to_string());
        config
    }

    #[test]
    fn test_default_config_needs_key_material() {
        let config = GatewayConfig::default();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("hmac_secret"));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = valid_config();
        config.server.gateway_port = 0;
        config.upstream.connect_timeout = Duration::ZERO;
        config.rate_limiting.local_limit_factor = 1.5;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("gateway_port"));
        assert!(err.contains("connect_timeout"));
        assert!(err.contains("local_limit_factor"));
    }

    #[test]
    fn test_parse_yaml_with_durations_and_routes() {
        let yaml = r#"
server:
  gateway_port: 8000
  admin_port: 8001
upstream:
  connect_timeout: 250ms
  response_timeout: 5s
auth:
  hmac_secret: dev-secret
  allowed_algorithms: [HS256]
route_source:
  type: static
  catalog:
    routes:
      - id: orders
        path: /api/orders
        upstreamUrl: http://orders:8080
        status: published
        rateLimitId: default
    rateLimitPolicies:
      - id: default
        requestsPerSecond: 10
        burstSize: 5
"#;
        let config = GatewayConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.server.gateway_port, 8000);
        assert_eq!(config.upstream.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.auth.allowed_algorithms, vec![Algorithm::HS256]);
        match config.route_source {
            RouteSourceConfig::Static { catalog } => {
                assert_eq!(catalog.routes.len(), 1);
                assert_eq!(catalog.rate_limit_policies[0].burst_size, 5);
            }
            other => panic!("unexpected source: {:?}", other),
        }
        assert!(config.redis.invalidation_channel.starts_with("gateway:"));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GATEWAY_SERVER_GATEWAY_PORT", "7000"),
            ("GATEWAY_REDIS_URL", "redis://cache:6379"),
            ("GATEWAY_UPSTREAM_RESPONSE_TIMEOUT", "3s"),
            ("GATEWAY_LOG_FORMAT", "text"),
        ]);
        let mut config = valid_config();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.gateway_port, 7000);
        assert!(config.redis.enabled);
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.upstream.response_timeout, Duration::from_secs(3));
        assert_eq!(config.observability.log_format, LogFormat::Text);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = valid_config();
        let result = config.apply_overrides(|key| {
            (key == "GATEWAY_SERVER_ADMIN_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
    }
}
