//! Serde default helpers shared across configuration types.

pub fn default_true() -> bool {
    true
}

pub fn default_listen_port() -> u16 {
    8080
}

pub fn default_auth_header() -> String {
    "Authorization".to_string()
}

pub fn default_reload_interval_secs() -> u64 {
    1
}

pub fn default_proxy_timeout_secs() -> u64 {
    30
}

pub fn default_shutdown_timeout_secs() -> u64 {
    30
}

pub fn default_storage_timeout_ms() -> u64 {
    2000
}

pub fn default_retry_attempts() -> u32 {
    3
}

pub fn default_sync_interval_secs() -> u64 {
    3
}

pub fn default_connection_timeout_secs() -> u64 {
    30
}

pub fn default_quota_thresholds() -> Vec<f64> {
    vec![0.8, 1.0]
}

pub fn default_cache_timeout_secs() -> u64 {
    60
}

pub fn default_cacheable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

pub fn default_cacheable_status_codes() -> Vec<u16> {
    vec![200]
}

pub fn default_identity_claim() -> String {
    "sub".to_string()
}

pub fn default_version_key() -> String {
    "version".to_string()
}

pub fn default_version_name() -> String {
    "Default".to_string()
}

pub fn default_hmac_clock_skew_ms() -> u64 {
    1000
}

pub fn default_backup_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("backups")
}
