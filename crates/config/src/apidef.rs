//! API definition model.
//!
//! An [`ApiDefinition`] describes one published API: where it listens, where
//! it proxies to, how callers authenticate, and which transforms, limits and
//! cache rules apply. Definitions are immutable once loaded; a reload
//! replaces the whole set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::defaults::*;

/// Authentication mode for an API. Exactly one is active per definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Keyless,
    Token,
    Hmac,
    Jwt,
    Oauth2,
    Basic,
    Mtls,
    Openid,
    Custom,
}

/// Protocol an API's extra listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenProtocol {
    #[default]
    Http,
    Https,
    Tcp,
    Tls,
}

/// Where the requested API version is carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionLocation {
    #[default]
    Header,
    UrlParam,
    /// First path segment after the listen path
    Url,
}

/// Version resolution settings for an API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConfig {
    #[serde(default)]
    pub location: VersionLocation,
    /// Header or query parameter name carrying the version
    #[serde(default = "default_version_key")]
    pub key: String,
    /// Version used when the request carries none
    #[serde(default = "default_version_name")]
    pub default: String,
    /// When true, version resolution is skipped entirely
    #[serde(default)]
    pub not_versioned: bool,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            location: VersionLocation::Header,
            key: default_version_key(),
            default: default_version_name(),
            not_versioned: true,
        }
    }
}

/// A path pattern with optional method restriction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMatch {
    pub pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Allow / ignore / block lists for one version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionPaths {
    /// When non-empty, only matching paths are admitted
    #[serde(default)]
    pub allow: Vec<PathMatch>,
    /// Matching paths skip authentication and limits
    #[serde(default)]
    pub ignore: Vec<PathMatch>,
    /// Matching paths are refused outright
    #[serde(default)]
    pub block: Vec<PathMatch>,
}

/// Per-version path rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub name: String,
    /// RFC 3339 timestamp after which the version refuses traffic
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub paths: VersionPaths,
}

/// CORS settings for an API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub exposed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub max_age: u32,
    /// When true, OPTIONS requests are forwarded upstream after CORS
    /// headers are applied instead of being answered by the gateway
    #[serde(default)]
    pub options_passthrough: bool,
}

/// IP allow / deny lists. Entries are addresses or CIDR prefixes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpAccessConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Circuit breaker settings for one path/method scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathBreakerConfig {
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    /// Failure ratio (0.0..=1.0) that trips the breaker
    pub threshold: f64,
    /// Number of consecutive samples the ratio is computed over
    pub samples: u64,
    /// Cool-down in seconds before a recovery probe is allowed
    pub return_to_service_after: u64,
}

/// Enforced upstream timeout for one path/method scope, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardTimeoutConfig {
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    pub timeout: u64,
}

/// URL rewrite rule: requests matching `match_pattern` (a regex over the
/// stripped path) are rewritten to `rewrite_to`, which may reference capture
/// groups as `$1`, `$2`, …
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRewrite {
    pub match_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    pub rewrite_to: String,
}

/// Method transform: requests matching the path get their method replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodTransform {
    pub path: String,
    pub method: String,
    pub to_method: String,
}

/// JSON body transform: set and remove top-level fields of a JSON body.
/// Non-JSON bodies pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyTransform {
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub add: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Header set/remove operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderInjection {
    #[serde(default)]
    pub add: HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Request and response header transforms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderTransforms {
    #[serde(default)]
    pub request: HeaderInjection,
    #[serde(default)]
    pub response: HeaderInjection,
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_timeout_secs")]
    pub timeout: u64,
    /// Cache every GET/HEAD regardless of per-path lists
    #[serde(default)]
    pub cache_all_safe_requests: bool,
    #[serde(default = "default_cacheable_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_cacheable_status_codes")]
    pub response_codes: Vec<u16>,
    /// Paths (regexes) the cache applies to when not caching all safe requests
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: default_cache_timeout_secs(),
            cache_all_safe_requests: false,
            methods: default_cacheable_methods(),
            response_codes: default_cacheable_status_codes(),
            paths: Vec::new(),
        }
    }
}

/// JWT validation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Base64 HMAC secret or PEM public key
    #[serde(default)]
    pub source: String,
    /// `hmac` or `rsa`
    #[serde(default)]
    pub signing_method: String,
    #[serde(default = "default_identity_claim")]
    pub identity_claim: String,
    /// Claim listing policy ids to apply to the synthesized session
    #[serde(default)]
    pub policy_claim: String,
    /// Allowed clock skew in seconds for exp/nbf validation
    #[serde(default)]
    pub clock_skew: u64,
    /// Default policies applied when the policy claim is absent
    #[serde(default)]
    pub default_policies: Vec<String>,
}

/// OpenID Connect restrictions, layered on JWT validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenidConfig {
    #[serde(default)]
    pub issuers: Vec<String>,
    #[serde(default)]
    pub client_ids: Vec<String>,
}

/// How callers present credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default = "default_auth_header")]
    pub auth_header_name: String,
    /// Also accept the key from this query parameter
    #[serde(default)]
    pub param_name: Option<String>,
    /// Also accept the key from this cookie
    #[serde(default)]
    pub cookie_name: Option<String>,
    /// Strip a `Bearer ` style prefix before lookup
    #[serde(default)]
    pub strip_authorization_scheme: bool,
    #[serde(default)]
    pub hmac_allowed_algorithms: Vec<String>,
    #[serde(default = "default_hmac_clock_skew_ms")]
    pub hmac_allowed_clock_skew_ms: u64,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub openid: OpenidConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Keyless,
            auth_header_name: default_auth_header(),
            param_name: None,
            cookie_name: None,
            strip_authorization_scheme: false,
            hmac_allowed_algorithms: Vec::new(),
            hmac_allowed_clock_skew_ms: default_hmac_clock_skew_ms(),
            jwt: JwtConfig::default(),
            openid: OpenidConfig::default(),
        }
    }
}

/// One custom middleware handler descriptor. Drivers are opaque to the
/// engine; handlers run in declared order within their slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareHook {
    pub driver: String,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub requires_session: bool,
}

/// Custom middleware chain specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomMiddleware {
    #[serde(default)]
    pub pre: Vec<MiddlewareHook>,
    /// Replaces built-in authentication when set
    #[serde(default)]
    pub auth_check: Option<MiddlewareHook>,
    #[serde(default)]
    pub post_key_auth: Vec<MiddlewareHook>,
    #[serde(default)]
    pub post: Vec<MiddlewareHook>,
    #[serde(default)]
    pub response: Vec<MiddlewareHook>,
}

/// A named response processor with free-form options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseProcessor {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Upstream TLS constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamTls {
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub max_version: Option<String>,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Immutable description of one published API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub api_id: String,
    pub name: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Path prefix this API claims on its port
    pub listen_path: String,
    /// Upstream target URLs; multiple targets round-robin
    pub target_urls: Vec<String>,
    #[serde(default = "default_true")]
    pub strip_listen_path: bool,
    /// Optional host match; empty matches any host
    #[serde(default)]
    pub domain: Option<String>,
    /// Extra listen port; must be whitelisted in the gateway config
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub protocol: ListenProtocol,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub version_config: VersionConfig,
    #[serde(default)]
    pub versions: HashMap<String, VersionInfo>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub ip_access: IpAccessConfig,
    #[serde(default)]
    pub circuit_breakers: Vec<PathBreakerConfig>,
    #[serde(default)]
    pub hard_timeouts: Vec<HardTimeoutConfig>,
    #[serde(default)]
    pub url_rewrites: Vec<UrlRewrite>,
    #[serde(default)]
    pub method_transforms: Vec<MethodTransform>,
    #[serde(default)]
    pub body_transforms: Vec<BodyTransform>,
    #[serde(default)]
    pub response_body_transforms: Vec<BodyTransform>,
    #[serde(default)]
    pub transform_headers: HeaderTransforms,
    #[serde(default)]
    pub cache_options: CacheOptions,
    #[serde(default)]
    pub response_processors: Vec<ResponseProcessor>,
    #[serde(default)]
    pub custom_middleware: CustomMiddleware,
    #[serde(default)]
    pub upstream_tls: UpstreamTls,
}

impl ApiDefinition {
    /// The port this API serves on, given the gateway's primary port.
    pub fn effective_port(&self, default_port: u16) -> u16 {
        self.listen_port.unwrap_or(default_port)
    }

    /// Whether requests on this API skip authentication entirely.
    pub fn is_keyless(&self) -> bool {
        self.auth.mode == AuthMode::Keyless
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_definition_deserializes() {
        let def: ApiDefinition = serde_json::from_str(
            r#"{
                "api_id": "httpbin",
                "name": "httpbin",
                "listen_path": "/httpbin/",
                "target_urls": ["http://127.0.0.1:8000/"]
            }"#,
        )
        .unwrap();

        assert_eq!(def.api_id, "httpbin");
        assert!(def.active);
        assert!(def.strip_listen_path);
        assert_eq!(def.auth.mode, AuthMode::Keyless);
        assert_eq!(def.protocol, ListenProtocol::Http);
        assert!(def.versions.is_empty());
    }

    #[test]
    fn auth_mode_snake_case() {
        let def: ApiDefinition = serde_json::from_str(
            r#"{
                "api_id": "a",
                "name": "a",
                "listen_path": "/a/",
                "target_urls": ["http://u/"],
                "auth": { "mode": "token", "auth_header_name": "X-Api-Key" }
            }"#,
        )
        .unwrap();
        assert_eq!(def.auth.mode, AuthMode::Token);
        assert_eq!(def.auth.auth_header_name, "X-Api-Key");
    }

    #[test]
    fn effective_port_prefers_api_port() {
        let mut def: ApiDefinition = serde_json::from_str(
            r#"{"api_id":"a","name":"a","listen_path":"/a/","target_urls":["http://u/"]}"#,
        )
        .unwrap();
        assert_eq!(def.effective_port(8080), 8080);
        def.listen_port = Some(9000);
        assert_eq!(def.effective_port(8080), 9000);
    }
}
