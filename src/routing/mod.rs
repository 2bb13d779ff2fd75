//! # Routing Module
//!
//! Published routes, the sources they are read from, and the hot-reloadable cache
//! that serves lookups on the request path.

pub mod cache;
pub mod invalidation;
pub mod route;
pub mod source;

pub use cache::{RouteCache, RouteSnapshot};
pub use invalidation::{InvalidationBus, InvalidationEvent};
pub use route::{ConsumerRateLimit, RateLimitPolicy, Route, RouteCatalog, RouteStatus};
pub use source::{FileRouteSource, HttpRouteSource, RouteSource, StaticRouteSource};
