//! Error types for the Gantry gateway.
//!
//! This module defines the error type used throughout the platform, with a
//! focus on clear failure modes and a stable mapping to client-visible
//! HTTP responses.

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Definition failed validation and was excluded from the load
    #[error("Definition '{api_id}' rejected: {reason}")]
    DefinitionRejected { api_id: String, reason: String },

    /// Authentication errors (missing/invalid key, bad signature)
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Authorization errors (valid session, insufficient rights)
    #[error("Authorization failed: {reason}")]
    AuthorizationFailed { reason: String },

    /// Session quota exhausted for the current renewal window
    #[error("Quota exceeded")]
    QuotaExceeded { remaining: i64, renews_at: i64 },

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded { limit: u64, reset_at: i64 },

    /// Circuit breaker rejected the request
    #[error("Circuit breaker open: {path}")]
    CircuitOpen { path: String },

    /// Upstream connection or protocol errors
    #[error("Upstream error: {upstream} - {message}")]
    Upstream {
        upstream: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Enforced timeout expired while waiting on the upstream
    #[error("Upstream timeout after {duration_ms}ms")]
    UpstreamTimeout { duration_ms: u64 },

    /// Key/value store errors
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Remote sync (config service / policy service) errors
    #[error("Sync error: {message}")]
    Sync {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A custom middleware handler panicked or failed
    #[error("Middleware '{name}' failed: {message}")]
    Middleware { name: String, message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Config { .. } => 500,
            Self::DefinitionRejected { .. } => 500,
            Self::AuthenticationFailed { .. } => 401,
            Self::AuthorizationFailed { .. } => 403,
            Self::QuotaExceeded { .. } => 403,
            Self::RateLimitExceeded { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::Upstream { .. } => 502,
            Self::UpstreamTimeout { .. } => 504,
            Self::Storage { .. } => 503,
            Self::Sync { .. } => 500,
            Self::Middleware { .. } => 500,
            Self::Internal { .. } => 500,
            Self::Io { .. } => 500,
        }
    }

    /// Get a client-safe error message (without internal details)
    pub fn client_message(&self) -> String {
        match self {
            Self::AuthenticationFailed { reason } => reason.clone(),
            Self::AuthorizationFailed { reason } => reason.clone(),
            Self::QuotaExceeded { .. } => "Quota exceeded".to_string(),
            Self::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            Self::CircuitOpen { .. } => "Service temporarily unavailable".to_string(),
            Self::Upstream { .. } => "Bad gateway".to_string(),
            Self::UpstreamTimeout { .. } => {
                "Upstream service reached hard timeout".to_string()
            }
            Self::Storage { .. } => "Service temporarily unavailable".to_string(),
            _ => "Internal server error".to_string(),
        }
    }

    /// Render the client-visible JSON body for this error
    pub fn to_json_body(&self) -> String {
        serde_json::json!({ "error": self.client_message() }).to_string()
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn sync(message: impl Into<String>) -> Self {
        Self::Sync {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::AuthorizationFailed {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}
