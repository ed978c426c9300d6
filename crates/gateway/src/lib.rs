//! Gantry API gateway data-plane engine.
//!
//! The engine accepts client traffic, matches it to a published API through
//! the proxy mux, runs the per-API request pipeline (auth, limits,
//! transforms, cache), proxies to the upstream through Pingora, and runs the
//! response pipeline on the way back. API definitions and policies are held
//! in atomically-swapped snapshots that a single reload coordinator rebuilds
//! from the configured sources without interrupting traffic.
//!
//! Module map:
//!
//! - [`storage`]: key/value store adapter, session store, certificate store
//! - [`registry`]: API and policy snapshots, compiled [`registry::ApiSpec`]
//! - [`mux`]: port/host/path routing table with atomic install
//! - [`pipeline`]: request pipeline stages and custom middleware slots
//! - [`limits`]: rate limiter strategies and the quota manager
//! - [`cache`]: response cache with single-flight fetch
//! - [`upstream`]: target selection, URL joining, enforced timeouts
//! - [`reload`]: reload coordinator and graceful drain
//! - [`sync`]: remote config-service client and emergency backups
//! - [`loader`]: definition and policy sources
//! - [`events`]: in-process notifier and cluster notifications
//! - [`control`]: control-plane builtin endpoints
//! - [`gateway`]: the Pingora `ProxyHttp` service

pub mod analytics;
pub mod cache;
pub mod control;
pub mod events;
pub mod gateway;
pub mod limits;
pub mod loader;
pub mod mux;
pub mod pipeline;
pub mod registry;
pub mod reload;
pub mod resources;
pub mod storage;
pub mod sync;
pub mod tcp;
pub mod upstream;
pub mod websocket;

pub use gateway::{GantryGateway, RequestContext};
pub use registry::{ApiRegistry, ApiSnapshot, ApiSpec, PolicyRegistry};
pub use reload::{GracefulDrain, ReloadCoordinator};
