//! The per-API request pipeline.
//!
//! Stages are tagged variants with a uniform apply contract; the chain for
//! an API is built at load time from its definition and executed in order
//! on the serving task. Any stage may short-circuit with a terminal
//! response; analytics recording always runs on exit regardless.

pub mod auth;
pub mod authz;
pub mod cors;
pub mod ip;
pub mod slots;
pub mod transforms;
pub mod version;

use bytes::Bytes;
use http::HeaderMap;
use std::sync::Arc;
use tracing::{debug, trace};

use gantry_common::{BreakerAdmission, GatewayError, GatewayResult, RequestMetrics};
use gantry_config::GatewayConfig;

use crate::cache::{self, CacheEntry};
use crate::events::Notifier;
use crate::gateway::context::RequestContext;
use crate::limits::{QuotaManager, RateLimiter};
use crate::registry::{ApiSpec, PolicyRegistry};
use crate::storage::{CertificateStore, KeyValueStore, SessionStore};

pub use slots::{
    run_response_slot, DriverRegistry, MiddlewareDriver, ResponseSlotOutcome, SlotOutcome,
};

/// A response that terminates the pipeline.
#[derive(Debug, Clone)]
pub struct TerminalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TerminalResponse {
    pub fn json_error(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from(
                serde_json::json!({ "error": message }).to_string(),
            ),
        }
    }

    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            status: err.to_http_status(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from(err.to_json_body()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Decision returned by each stage.
#[derive(Debug)]
pub enum StageDecision {
    Continue,
    Terminate(TerminalResponse),
}

/// Read-only view of the request handed to stages.
pub struct RequestParts {
    pub method: String,
    /// Path as received, before listen-path stripping
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client_ip: String,
    pub client_cert_fingerprint: Option<String>,
    /// Buffered request body, present when a stage needs it
    pub body: Option<Bytes>,
}

impl RequestParts {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == name {
                return Some(value.to_string());
            }
        }
        None
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header("cookie")?;
        for part in raw.split(';') {
            let (key, value) = part.trim().split_once('=')?;
            if key == name {
                return Some(value.to_string());
            }
        }
        None
    }
}

/// Shared handles the stages operate on.
pub struct PipelineDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub sessions: Arc<SessionStore>,
    pub certs: Arc<CertificateStore>,
    pub policies: Arc<PolicyRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quotas: Arc<QuotaManager>,
    pub cache: Arc<crate::cache::ResponseCache>,
    pub drivers: Arc<DriverRegistry>,
    pub notifier: Arc<Notifier>,
    pub metrics: Arc<RequestMetrics>,
    pub config: Arc<GatewayConfig>,
}

/// One stage of the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    VersionCheck,
    SlotPre,
    IpAccess,
    Cors,
    Auth,
    SlotPostKeyAuth,
    Authorize,
    RateLimit,
    Quota,
    Transforms,
    SlotPost,
    CacheLookup,
    BreakerAdmission,
}

/// Build the ordered stage list for an API. Disabled concerns are left out
/// at build time so the request path never re-checks them.
pub fn build_stages(spec: &ApiSpec) -> Vec<RequestStage> {
    let def = &spec.def;
    let mut stages = Vec::new();

    stages.push(RequestStage::VersionCheck);
    if !def.custom_middleware.pre.is_empty() {
        stages.push(RequestStage::SlotPre);
    }
    if !def.ip_access.allow.is_empty() || !def.ip_access.deny.is_empty() {
        stages.push(RequestStage::IpAccess);
    }
    if def.cors.enabled {
        stages.push(RequestStage::Cors);
    }
    stages.push(RequestStage::Auth);
    if !def.custom_middleware.post_key_auth.is_empty() {
        stages.push(RequestStage::SlotPostKeyAuth);
    }
    if !def.is_keyless() {
        stages.push(RequestStage::Authorize);
        stages.push(RequestStage::RateLimit);
        stages.push(RequestStage::Quota);
    }
    stages.push(RequestStage::Transforms);
    if !def.custom_middleware.post.is_empty() {
        stages.push(RequestStage::SlotPost);
    }
    if def.cache_options.enabled {
        stages.push(RequestStage::CacheLookup);
    }
    if !def.circuit_breakers.is_empty() {
        stages.push(RequestStage::BreakerAdmission);
    }

    stages
}

/// Run the pipeline. Returns `None` to continue to upstream dispatch, or
/// the terminal response that ends the request here.
pub async fn run(
    stages: &[RequestStage],
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> Option<TerminalResponse> {
    for stage in stages {
        trace!(trace_id = %ctx.trace_id, stage = ?stage, "Entering pipeline stage");
        let decision = apply(*stage, spec, deps, parts, ctx).await;
        match decision {
            Ok(StageDecision::Continue) => {}
            Ok(StageDecision::Terminate(response)) => {
                debug!(
                    trace_id = %ctx.trace_id,
                    stage = ?stage,
                    status = response.status,
                    "Pipeline short-circuited"
                );
                return Some(response);
            }
            Err(err) => {
                let reason = stage_block_reason(*stage);
                ctx.blocked_reason = Some(reason.to_string());
                deps.metrics.record_blocked(reason);
                debug!(
                    trace_id = %ctx.trace_id,
                    stage = ?stage,
                    error = %err,
                    "Pipeline stage rejected request"
                );
                return Some(decorate_limit_headers(
                    TerminalResponse::from_error(&err),
                    ctx,
                ));
            }
        }
    }
    None
}

async fn apply(
    stage: RequestStage,
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    match stage {
        RequestStage::VersionCheck => version::apply(spec, parts, ctx),
        RequestStage::SlotPre => {
            slots::run_slot(&spec.def.custom_middleware.pre, deps, parts, ctx).await
        }
        RequestStage::IpAccess => ip::apply(spec, parts, ctx),
        RequestStage::Cors => cors::apply(spec, parts, ctx),
        RequestStage::Auth => auth::apply(spec, deps, parts, ctx).await,
        RequestStage::SlotPostKeyAuth => {
            slots::run_slot(&spec.def.custom_middleware.post_key_auth, deps, parts, ctx).await
        }
        RequestStage::Authorize => authz::apply(spec, parts, ctx),
        RequestStage::RateLimit => rate_stage(spec, deps, ctx).await,
        RequestStage::Quota => quota_stage(spec, deps, ctx).await,
        RequestStage::Transforms => transforms::apply(spec, parts, ctx),
        RequestStage::SlotPost => {
            slots::run_slot(&spec.def.custom_middleware.post, deps, parts, ctx).await
        }
        RequestStage::CacheLookup => cache_stage(spec, deps, parts, ctx).await,
        RequestStage::BreakerAdmission => breaker_stage(spec, ctx),
    }
}

fn stage_block_reason(stage: RequestStage) -> &'static str {
    match stage {
        RequestStage::VersionCheck => "version",
        RequestStage::IpAccess => "ip_denied",
        RequestStage::Cors => "cors",
        RequestStage::Auth => "auth_failed",
        RequestStage::Authorize => "access_denied",
        RequestStage::RateLimit => "rate_limited",
        RequestStage::Quota => "quota_exceeded",
        RequestStage::BreakerAdmission => "breaker_open",
        RequestStage::SlotPre
        | RequestStage::SlotPostKeyAuth
        | RequestStage::SlotPost => "middleware",
        RequestStage::Transforms => "transform",
        RequestStage::CacheLookup => "cache",
    }
}

/// Rate and quota headers belong on rejections too.
fn decorate_limit_headers(
    mut response: TerminalResponse,
    ctx: &RequestContext,
) -> TerminalResponse {
    let info = ctx.quota_info.or(ctx.rate_info);
    if let Some(info) = info {
        response
            .headers
            .push(("X-RateLimit-Limit".to_string(), info.limit.to_string()));
        response.headers.push((
            "X-RateLimit-Remaining".to_string(),
            info.remaining.to_string(),
        ));
        response
            .headers
            .push(("X-RateLimit-Reset".to_string(), info.reset_at.to_string()));
    }
    response
}

async fn rate_stage(
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    if ctx.ignore_auth {
        return Ok(StageDecision::Continue);
    }
    let Some(session) = ctx.session.clone() else {
        return Ok(StageDecision::Continue);
    };
    let Some(key_hash) = ctx.key_hash.clone() else {
        return Ok(StageDecision::Continue);
    };

    let (rate, per) = session.rate_for(spec.api_id());
    let decision = match deps
        .rate_limiter
        .allow(&key_hash, spec.api_id(), rate, per)
        .await
    {
        Ok(decision) => decision,
        Err(err) if deps.config.storage.fail_open => {
            debug!(trace_id = %ctx.trace_id, error = %err, "Store unavailable, rate check fails open");
            return Ok(StageDecision::Continue);
        }
        Err(err) => return Err(err),
    };

    if decision.limit > 0 {
        ctx.rate_info = Some(crate::gateway::context::LimitHeaderInfo {
            limit: decision.limit as i64,
            remaining: decision.remaining as i64,
            reset_at: decision.reset_at,
        });
    }

    if !decision.allowed {
        return Err(GatewayError::RateLimitExceeded {
            limit: decision.limit,
            reset_at: decision.reset_at,
        });
    }
    Ok(StageDecision::Continue)
}

async fn quota_stage(
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    if ctx.ignore_auth {
        return Ok(StageDecision::Continue);
    }
    let Some(session) = ctx.session.clone() else {
        return Ok(StageDecision::Continue);
    };
    let Some(key_hash) = ctx.key_hash.clone() else {
        return Ok(StageDecision::Continue);
    };

    let (quota_max, renewal_rate, scope) = session.quota_for(spec.api_id());
    let decision = match deps
        .quotas
        .record(&key_hash, &scope, quota_max, renewal_rate)
        .await
    {
        Ok(decision) => decision,
        Err(err) if deps.config.storage.fail_open => {
            debug!(trace_id = %ctx.trace_id, error = %err, "Store unavailable, quota check fails open");
            return Ok(StageDecision::Continue);
        }
        Err(err) => return Err(err),
    };

    if decision.limit >= 0 {
        ctx.quota_info = Some(crate::gateway::context::LimitHeaderInfo {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.renews_at,
        });
    }

    deps.quotas.emit_triggers(
        &deps.notifier,
        &decision,
        &key_hash,
        spec.api_id(),
        &session.org_id,
    );
    for &threshold in &decision.thresholds_crossed {
        deps.metrics.record_quota_trigger(spec.api_id(), threshold);
    }

    if !decision.allowed {
        return Err(GatewayError::QuotaExceeded {
            remaining: decision.remaining,
            renews_at: decision.renews_at,
        });
    }
    Ok(StageDecision::Continue)
}

async fn cache_stage(
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let stripped = ctx
        .outbound_path
        .clone()
        .unwrap_or_else(|| spec.strip_path(&parts.path).to_string());
    let method = ctx.outbound_method.as_deref().unwrap_or(&parts.method);

    if !spec.is_cacheable_request(&stripped, method) {
        return Ok(StageDecision::Continue);
    }

    let body_hash = parts.body.as_deref().filter(|b| !b.is_empty());
    let key = cache::fingerprint(
        spec.api_id(),
        method,
        &stripped,
        ctx.query.as_deref(),
        body_hash,
    );
    ctx.cache_key = Some(key);
    ctx.cache_ttl = Some(std::time::Duration::from_secs(
        spec.def.cache_options.timeout,
    ));

    match deps.cache.lookup(key).await {
        CacheEntry::Hit(entry) => {
            deps.metrics.record_cache_event("hit");
            ctx.served_from_cache = true;
            let mut response = TerminalResponse {
                status: entry.status,
                headers: entry.headers.clone(),
                body: entry.body.clone(),
            };
            response = response.with_header("X-Gantry-Cached-Response", "1");
            Ok(StageDecision::Terminate(decorate_limit_headers(
                response, ctx,
            )))
        }
        CacheEntry::Miss(guard) => {
            deps.metrics.record_cache_event("miss");
            ctx.cache_guard = Some(guard);
            ctx.buffer_response = true;
            Ok(StageDecision::Continue)
        }
    }
}

fn breaker_stage(
    spec: &Arc<ApiSpec>,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let stripped = ctx
        .outbound_path
        .clone()
        .unwrap_or_else(|| spec.strip_path(&ctx.path).to_string());
    let method = ctx.outbound_method.as_deref().unwrap_or(&ctx.method);

    let Some(breaker) = spec.breaker_for(&stripped, method) else {
        return Ok(StageDecision::Continue);
    };

    match breaker.admit() {
        BreakerAdmission::Allowed | BreakerAdmission::Probe => {
            ctx.breaker = Some(breaker);
            Ok(StageDecision::Continue)
        }
        BreakerAdmission::Rejected => Err(GatewayError::CircuitOpen { path: stripped }),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::limits::{QuotaManager, RateLimiter};
    use crate::storage::{CertificateStore, MemoryStore, SessionStore};
    use std::sync::OnceLock;

    pub fn spec_from_json(raw: &str) -> Arc<ApiSpec> {
        let def: gantry_config::ApiDefinition =
            serde_json::from_str(raw).expect("test definition must parse");
        Arc::new(ApiSpec::build(def).expect("test definition must compile"))
    }

    pub fn parts_for(method: &str, path_and_query: &str, headers: &[(&str, &str)]) -> RequestParts {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                http::header::HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestParts {
            method: method.to_string(),
            path,
            query,
            headers: header_map,
            client_ip: "127.0.0.1:40000".to_string(),
            client_cert_fingerprint: None,
            body: None,
        }
    }

    pub fn parts_with_ip(method: &str, path: &str, client_ip: &str) -> RequestParts {
        let mut parts = parts_for(method, path, &[]);
        parts.client_ip = client_ip.to_string();
        parts
    }

    fn shared_metrics() -> Arc<RequestMetrics> {
        static METRICS: OnceLock<Arc<RequestMetrics>> = OnceLock::new();
        METRICS
            .get_or_init(|| Arc::new(RequestMetrics::new().expect("metrics registration")))
            .clone()
    }

    pub fn deps_for_tests() -> PipelineDeps {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(GatewayConfig::default());
        PipelineDeps {
            sessions: Arc::new(SessionStore::new(Arc::clone(&store), true)),
            certs: Arc::new(CertificateStore::new()),
            policies: Arc::new(PolicyRegistry::new()),
            rate_limiter: Arc::new(RateLimiter::new(
                Arc::clone(&store),
                &config.rate_limit,
            )),
            quotas: Arc::new(QuotaManager::new(
                Arc::clone(&store),
                config.quota_trigger_thresholds.clone(),
            )),
            cache: Arc::new(crate::cache::ResponseCache::new()),
            drivers: Arc::new(DriverRegistry::new()),
            notifier: Arc::new(Notifier::new()),
            metrics: shared_metrics(),
            config,
            store,
        }
    }
}
