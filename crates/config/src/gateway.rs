//! Gateway bootstrap configuration.
//!
//! This is the gateway's own configuration (ports, storage, sync sources,
//! timeouts), loaded once at startup from a JSON file. API definitions and
//! policies are *not* part of this file; they are loaded through the
//! configured sources and hot-reloaded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use gantry_common::{GatewayError, GatewayResult};

use crate::defaults::*;

/// Backing key/value store selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Redis,
    /// In-process store; single-node only, used by tests and dev setups
    Memory,
}

/// Key/value store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_storage_timeout_ms")]
    pub timeout_ms: u64,
    /// Admit requests when the store is unreachable instead of failing 503
    #[serde(default)]
    pub fail_open: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Redis,
            url: default_redis_url(),
            timeout_ms: default_storage_timeout_ms(),
            fail_open: false,
        }
    }
}

/// Where policies are loaded from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    #[default]
    File,
    Service,
}

/// Policy source settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    #[serde(default)]
    pub source: PolicySource,
    /// Directory or file of policy JSON when `source` is `file`
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Base URL of the policy service when `source` is `service`
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Honor explicit policy ids from the service instead of record ids
    #[serde(default)]
    pub allow_explicit_policy_id: bool,
}

/// Remote config service (definitions source) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfigOptions {
    /// Pull API definitions from the remote service instead of a directory
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout: u64,
}

/// Retry settings for reload-time syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSyncConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Backoff between attempts, seconds
    #[serde(default = "default_sync_interval_secs")]
    pub interval: u64,
}

impl Default for ResourceSyncConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            interval: default_sync_interval_secs(),
        }
    }
}

/// Rate limiting strategy selection. One strategy is active gateway-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Store-side counter with TTL (default)
    #[default]
    TokenBucket,
    /// Sliding window of request timestamps in the store
    RollingWindow,
    /// Wall-clock aligned window
    FixedWindow,
}

/// Rate limiter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub strategy: RateLimitStrategy,
    /// Node-local advisory pre-filter. Only honored for single-node
    /// deployments; ignored when a distributed strategy is active.
    #[serde(default)]
    pub enable_node_advisory: bool,
}

/// HTTP server level toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerOptions {
    #[serde(default = "default_true")]
    pub enable_websockets: bool,
    /// Strip trailing slashes from request paths before matching
    #[serde(default)]
    pub strip_trailing_slashes: bool,
    /// Terminate TLS on the listeners using the certificate below
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub ssl_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub ssl_key_file: Option<PathBuf>,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            enable_websockets: true,
            strip_trailing_slashes: false,
            use_ssl: false,
            ssl_cert_file: None,
            ssl_key_file: None,
        }
    }
}

/// Gateway bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GatewayConfig {
    /// Bind address; empty binds every interface
    #[serde(default)]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Control API port; control endpoints share the primary port when unset
    #[serde(default)]
    pub control_api_port: Option<u16>,
    /// Shared secret guarding the control endpoints
    #[serde(default)]
    pub secret: String,
    /// Secret presented to the remote config service
    #[serde(default)]
    pub node_secret: String,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Hash session keys before persisting them
    #[serde(default = "default_true")]
    pub hash_keys: bool,
    /// Directory of API definition JSON files (file-based source)
    #[serde(default)]
    pub app_path: Option<PathBuf>,
    #[serde(default)]
    pub policies: PolicySourceConfig,
    #[serde(default)]
    pub db_app_conf_options: RemoteConfigOptions,
    #[serde(default)]
    pub resource_sync: ResourceSyncConfig,
    /// Minimum seconds between reload cycles
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval: u64,
    /// Default upstream timeout, seconds
    #[serde(default = "default_proxy_timeout_secs")]
    pub proxy_default_timeout: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub graceful_shutdown_timeout: u64,
    /// Extra ports APIs may listen on, besides the primary and control ports
    #[serde(default)]
    pub port_whitelist: Vec<u16>,
    /// Directory holding emergency-mode backups of remote syncs
    #[serde(default = "default_backup_dir")]
    pub backup_path: PathBuf,
    /// Directory of PEM certificates for the certificate store
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Quota thresholds (fractions of quota_max) that emit trigger events
    #[serde(default = "default_quota_thresholds")]
    #[validate(length(min = 1))]
    pub quota_trigger_thresholds: Vec<f64>,
    #[serde(default)]
    pub http_server_options: HttpServerOptions,
    /// Worker threads; 0 selects the CPU count
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default = "default_true")]
    pub enable_analytics: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: String::new(),
            listen_port: default_listen_port(),
            control_api_port: None,
            secret: String::new(),
            node_secret: String::new(),
            storage: StorageConfig::default(),
            hash_keys: true,
            app_path: None,
            policies: PolicySourceConfig::default(),
            db_app_conf_options: RemoteConfigOptions::default(),
            resource_sync: ResourceSyncConfig::default(),
            reload_interval: default_reload_interval_secs(),
            proxy_default_timeout: default_proxy_timeout_secs(),
            graceful_shutdown_timeout: default_shutdown_timeout_secs(),
            port_whitelist: Vec::new(),
            backup_path: default_backup_dir(),
            certificate_path: None,
            rate_limit: RateLimitConfig::default(),
            quota_trigger_thresholds: default_quota_thresholds(),
            http_server_options: HttpServerOptions::default(),
            worker_threads: 0,
            enable_analytics: true,
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
            message: format!("Failed to read config file {:?}", path),
            source: Some(Box::new(e)),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| GatewayError::Config {
            message: format!("Failed to parse config file {:?}: {}", path, e),
            source: None,
        })?;
        config.check()?;
        Ok(config)
    }

    /// Semantic validation beyond schema shape.
    pub fn check(&self) -> GatewayResult<()> {
        if self.db_app_conf_options.enabled {
            if self.node_secret.is_empty() {
                return Err(GatewayError::config(
                    "node_secret is required when the remote config source is enabled",
                ));
            }
            if self.db_app_conf_options.connection_string.is_none() {
                return Err(GatewayError::config(
                    "db_app_conf_options.connection_string is required when enabled",
                ));
            }
        }
        if self.policies.source == PolicySource::Service
            && self.policies.connection_string.is_none()
        {
            return Err(GatewayError::config(
                "policies.connection_string is required for the service source",
            ));
        }
        for threshold in &self.quota_trigger_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(GatewayError::config(format!(
                    "quota trigger threshold {} out of range 0.0..=1.0",
                    threshold
                )));
            }
        }
        if let Some(control) = self.control_api_port {
            if control == self.listen_port {
                return Err(GatewayError::config(
                    "control_api_port must differ from listen_port",
                ));
            }
        }
        if self.http_server_options.use_ssl
            && (self.http_server_options.ssl_cert_file.is_none()
                || self.http_server_options.ssl_key_file.is_none())
        {
            return Err(GatewayError::config(
                "use_ssl requires ssl_cert_file and ssl_key_file",
            ));
        }
        Ok(())
    }

    /// All ports the gateway may open listeners on.
    pub fn allowed_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.listen_port];
        if let Some(control) = self.control_api_port {
            ports.push(control);
        }
        for port in &self.port_whitelist {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }

    /// Whether an API may claim the given port.
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports().contains(&port)
    }
}
