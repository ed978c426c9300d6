//! Per-request context carried through the proxy lifecycle.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_common::CircuitBreaker;
use gantry_config::SessionState;

use crate::cache::FetchGuard;
use crate::registry::{ApiSpec, CompiledBodyTransform};

/// Limit information reflected into response headers.
#[derive(Debug, Clone, Copy)]
pub struct LimitHeaderInfo {
    pub limit: i64,
    pub remaining: i64,
    /// Absolute epoch seconds when the window resets or renews
    pub reset_at: i64,
}

/// Request context maintained throughout a single request.
///
/// Immutable fields (start time) stay private; the rest is `pub(crate)` for
/// direct access within the engine.
pub struct RequestContext {
    start_time: Instant,

    // === Tracing ===
    pub(crate) trace_id: String,

    // === Routing ===
    pub(crate) api: Option<Arc<ApiSpec>>,
    pub(crate) local_port: u16,

    // === Request metadata (cached for analytics) ===
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) client_ip: String,
    pub(crate) client_cert_fingerprint: Option<String>,

    // === Versioning ===
    pub(crate) version_name: Option<String>,
    /// Set when the resolved path is on the version's ignore list
    pub(crate) ignore_auth: bool,

    // === Session ===
    pub(crate) session: Option<SessionState>,
    /// Raw key as presented by the client
    pub(crate) session_key: Option<String>,
    /// Storage id (hashed when key hashing is on)
    pub(crate) key_hash: Option<String>,

    // === Limit headers ===
    pub(crate) rate_info: Option<LimitHeaderInfo>,
    pub(crate) quota_info: Option<LimitHeaderInfo>,

    // === Outbound request plan ===
    /// Stripped (and possibly rewritten) path to join onto the target
    pub(crate) outbound_path: Option<String>,
    pub(crate) outbound_method: Option<String>,
    pub(crate) request_header_add: Vec<(String, String)>,
    pub(crate) request_header_remove: Vec<String>,
    /// JSON transform applied to the request body, when planned
    pub(crate) request_body_transform: Option<Arc<CompiledBodyTransform>>,
    /// Buffered request body while a transform is pending
    pub(crate) request_body_buffer: Vec<u8>,
    /// JSON transform applied to the response body, when planned
    pub(crate) response_body_transform: Option<Arc<CompiledBodyTransform>>,

    // === Response plan ===
    pub(crate) response_header_add: Vec<(String, String)>,
    pub(crate) response_header_remove: Vec<String>,

    // === Caching ===
    pub(crate) cache_key: Option<u64>,
    /// Leadership over the in-flight fetch; storing happens at end of body
    pub(crate) cache_guard: Option<FetchGuard>,
    pub(crate) cache_ttl: Option<Duration>,
    pub(crate) served_from_cache: bool,
    /// Response headers captured for the cache writer
    pub(crate) captured_status: u16,
    pub(crate) captured_headers: Vec<(String, String)>,
    pub(crate) body_buffer: Vec<u8>,
    pub(crate) buffer_response: bool,

    // === Circuit breaker ===
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,

    // === Timeouts ===
    pub(crate) effective_timeout: Option<Duration>,
    pub(crate) timeout_is_enforced: bool,

    // === Upstream ===
    pub(crate) upstream_address: Option<String>,
    pub(crate) upstream_base_path: String,
    pub(crate) is_websocket_upgrade: bool,

    // === Accounting ===
    pub(crate) response_bytes: u64,
    pub(crate) blocked_reason: Option<String>,
    /// Whether this request was counted into the drain tracker
    pub(crate) drain_counted: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            trace_id: String::new(),
            api: None,
            local_port: 0,
            method: String::new(),
            path: String::new(),
            query: None,
            host: None,
            client_ip: String::new(),
            client_cert_fingerprint: None,
            version_name: None,
            ignore_auth: false,
            session: None,
            session_key: None,
            key_hash: None,
            rate_info: None,
            quota_info: None,
            outbound_path: None,
            outbound_method: None,
            request_header_add: Vec::new(),
            request_header_remove: Vec::new(),
            request_body_transform: None,
            request_body_buffer: Vec::new(),
            response_body_transform: None,
            response_header_add: Vec::new(),
            response_header_remove: Vec::new(),
            cache_key: None,
            cache_guard: None,
            cache_ttl: None,
            served_from_cache: false,
            captured_status: 0,
            captured_headers: Vec::new(),
            body_buffer: Vec::new(),
            buffer_response: false,
            breaker: None,
            effective_timeout: None,
            timeout_is_enforced: false,
            upstream_address: None,
            upstream_base_path: String::new(),
            is_websocket_upgrade: false,
            response_bytes: 0,
            blocked_reason: None,
            drain_counted: false,
        }
    }

    /// Context primed with request metadata, for callers that drive the
    /// pipeline outside the proxy lifecycle (tests, embedding).
    pub fn for_request(
        method: impl Into<String>,
        path: impl Into<String>,
        query: Option<String>,
        client_ip: impl Into<String>,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.method = method.into();
        ctx.path = path.into();
        ctx.query = query;
        ctx.client_ip = client_ip.into();
        ctx
    }

    #[inline]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    #[inline]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[inline]
    pub fn api_id(&self) -> Option<&str> {
        self.api.as_ref().map(|spec| spec.api_id())
    }

    #[inline]
    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    /// The body the cache writer buffered, if buffering was on.
    pub fn buffered_body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body_buffer)
    }

    /// Rate limit headers computed for this request, if any.
    #[inline]
    pub fn rate_limits(&self) -> Option<LimitHeaderInfo> {
        self.rate_info
    }

    /// Quota headers computed for this request, if any.
    #[inline]
    pub fn quota_limits(&self) -> Option<LimitHeaderInfo> {
        self.quota_info
    }

    /// The planned outbound path after stripping and rewrites.
    #[inline]
    pub fn outbound_path(&self) -> Option<&str> {
        self.outbound_path.as_deref()
    }

    #[inline]
    pub fn served_from_cache(&self) -> bool {
        self.served_from_cache
    }

    #[inline]
    pub fn ignores_auth(&self) -> bool {
        self.ignore_auth
    }

    #[inline]
    pub fn version(&self) -> Option<&str> {
        self.version_name.as_deref()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_empty() {
        let ctx = RequestContext::new();
        assert!(ctx.api.is_none());
        assert!(ctx.session.is_none());
        assert!(ctx.rate_info.is_none());
        assert!(!ctx.served_from_cache);
        assert!(ctx.elapsed() < Duration::from_secs(1));
    }
}
