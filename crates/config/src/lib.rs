//! Configuration and data model for the Gantry API gateway.
//!
//! This crate holds everything the engine loads or syncs: the gateway's own
//! bootstrap configuration, the API definition model, reusable policies, and
//! session state, plus validation of loaded definitions.
//!
//! # Module Organization
//!
//! - [`gateway`]: Bootstrap configuration (ports, storage, sources, timeouts)
//! - [`apidef`]: API definition model (routing, auth, transforms, cache)
//! - [`policy`]: Policy and access-rights model
//! - [`session`]: Session state and policy application
//! - [`validation`]: Definition validation
//! - [`defaults`]: Serde default helpers

pub mod apidef;
pub mod defaults;
pub mod gateway;
pub mod policy;
pub mod session;
pub mod validation;

pub use apidef::{
    ApiDefinition, AuthConfig, AuthMode, BodyTransform, CacheOptions, CorsConfig,
    CustomMiddleware, HardTimeoutConfig, HeaderInjection, HeaderTransforms, IpAccessConfig,
    JwtConfig, ListenProtocol, MethodTransform, MiddlewareHook, OpenidConfig, PathBreakerConfig,
    PathMatch, ResponseProcessor, UpstreamTls, UrlRewrite, VersionConfig, VersionInfo,
    VersionLocation, VersionPaths,
};
pub use gateway::{
    GatewayConfig, HttpServerOptions, PolicySource, PolicySourceConfig, RateLimitConfig,
    RateLimitStrategy, RemoteConfigOptions, ResourceSyncConfig, StorageConfig, StorageKind,
};
pub use policy::{
    AccessDefinition, AccessSpec, ApiLimit, Endpoint, EndpointMethod, FieldAccess, Policy,
    PolicyPartitions,
};
pub use session::SessionState;
pub use validation::{filter_valid, validate_definition};
