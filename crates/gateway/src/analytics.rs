//! Per-request analytics.
//!
//! One record per request, emitted on pipeline exit, including
//! short-circuited and failed requests. Records are JSON lines on a
//! dedicated tracing target so any subscriber (file appender, shipper)
//! can drain them without touching the engine.

use serde::Serialize;
use tracing::info;

/// One analytics record.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsRecord {
    pub timestamp: String,
    pub trace_id: String,
    pub api_id: Option<String>,
    pub org_id: Option<String>,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub status: u16,
    pub latency_ms: u64,
    pub client_ip: String,
    pub key_hash: Option<String>,
    pub version: Option<String>,
    pub cached: bool,
    pub blocked_reason: Option<String>,
    pub response_bytes: u64,
    pub upstream: Option<String>,
}

/// Analytics recorder. Disabled recording is a no-op so the exit path
/// stays branch-cheap.
pub struct AnalyticsRecorder {
    enabled: bool,
}

impl AnalyticsRecorder {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn record(&self, record: &AnalyticsRecord) {
        if !self.enabled {
            return;
        }
        match serde_json::to_string(record) {
            Ok(line) => {
                info!(target: "gantry::analytics", "{}", line);
            }
            Err(_) => {
                // A record that cannot serialize is dropped rather than
                // failing the request path
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
