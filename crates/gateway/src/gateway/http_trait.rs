//! ProxyHttp trait implementation for GantryGateway.
//!
//! This is the request lifecycle: mux match in the early filter, control
//! endpoints and the per-API pipeline in the request filter, target
//! selection and enforced timeouts at peer construction, the outbound plan
//! at upstream-request time, response transforms plus breaker accounting on
//! the way back, and cache writing while the body streams. Analytics and
//! drain accounting always run in `logging`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::proxy::{ProxyHttp, Session};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use gantry_common::BreakerEvent;

use crate::analytics::AnalyticsRecord;
use crate::cache::is_hop_by_hop;
use crate::control;
use crate::events::GatewayEvent;
use crate::pipeline::{self, RequestParts, TerminalResponse};
use crate::upstream::{
    build_peer, effective_timeout, single_joining_slash, HARD_TIMEOUT_BODY,
};
use crate::websocket;

use super::context::RequestContext;
use super::http::{get_or_create_trace_id, write_terminal};
use super::GantryGateway;

/// Port of the listener the request arrived on.
fn local_port(session: &Session, default_port: u16) -> u16 {
    session
        .server_addr()
        .map(|a| a.to_string())
        .and_then(|addr| addr.rsplit(':').next().and_then(|p| p.parse().ok()))
        .unwrap_or(default_port)
}

/// Client certificate fingerprint from the TLS handshake, when present.
fn client_cert_fingerprint(session: &Session) -> Option<String> {
    let digest = session.digest()?;
    let ssl = digest.ssl_digest.as_ref()?;
    if ssl.cert_digest.is_empty() {
        return None;
    }
    Some(
        ssl.cert_digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect(),
    )
}

#[async_trait]
impl ProxyHttp for GantryGateway {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext::new()
    }

    /// Capture request metadata and resolve the API before anything else.
    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        let req_header = session.req_header();

        ctx.method = req_header.method.as_str().to_string();
        ctx.path = req_header.uri.path().to_string();
        ctx.query = req_header.uri.query().map(|q| q.to_string());
        ctx.host = req_header
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        ctx.client_ip = session
            .client_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        ctx.local_port = local_port(session, self.config.listen_port);
        ctx.trace_id = get_or_create_trace_id(session);
        ctx.client_cert_fingerprint = client_cert_fingerprint(session);

        if control::is_control_request(&self.config, ctx.local_port, &ctx.path) {
            // Handled in request_filter; no API resolution needed
            return Ok(());
        }

        let host = ctx.host.as_deref().unwrap_or("");
        if let Some(spec) = self.mux.match_request(ctx.local_port, host, &ctx.path) {
            trace!(
                trace_id = %ctx.trace_id,
                api_id = %spec.api_id(),
                listen_path = %spec.def.listen_path,
                "API matched"
            );
            ctx.api = Some(spec);
        }
        Ok(())
    }

    /// Control endpoints and the per-API request pipeline.
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        // New work is refused once shutdown started
        if self.drain.is_shutdown_requested() {
            write_terminal(
                session,
                &TerminalResponse::json_error(503, "Gateway is shutting down"),
            )
            .await?;
            return Ok(true);
        }

        self.drain.inc_requests();
        ctx.drain_counted = true;

        // Control plane
        if control::is_control_request(&self.config, ctx.local_port, &ctx.path) {
            let auth_header = session
                .req_header()
                .headers
                .get(control::AUTH_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let state = self.control_state();
            let response = control::handle(
                &state,
                &ctx.method,
                &ctx.path,
                ctx.query.as_deref(),
                auth_header.as_deref(),
            )
            .await;
            write_terminal(session, &response).await?;
            return Ok(true);
        }

        let Some(spec) = ctx.api.clone() else {
            debug!(
                trace_id = %ctx.trace_id,
                method = %ctx.method,
                path = %ctx.path,
                "No API matched for request"
            );
            write_terminal(session, &TerminalResponse::json_error(404, "Not Found")).await?;
            return Ok(true);
        };

        // WebSocket upgrades ride through when enabled at server level
        if websocket::is_websocket_upgrade(&session.req_header().headers) {
            if !self.config.http_server_options.enable_websockets {
                write_terminal(
                    session,
                    &TerminalResponse::json_error(400, "WebSocket upgrades are disabled"),
                )
                .await?;
                return Ok(true);
            }
            ctx.is_websocket_upgrade = true;
        }

        let parts = RequestParts {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            query: ctx.query.clone(),
            headers: session.req_header().headers.clone(),
            client_ip: ctx.client_ip.clone(),
            client_cert_fingerprint: ctx.client_cert_fingerprint.clone(),
            body: None,
        };

        let stages = pipeline::build_stages(&spec);
        if let Some(response) = pipeline::run(&stages, &spec, &self.deps, &parts, ctx).await
        {
            write_terminal(session, &response).await?;
            return Ok(true);
        }

        // Effective upstream deadline for this request
        let stripped = ctx
            .outbound_path
            .clone()
            .unwrap_or_else(|| spec.strip_path(&ctx.path).to_string());
        let method = ctx.outbound_method.clone().unwrap_or_else(|| ctx.method.clone());
        let (timeout, enforced) = effective_timeout(
            &spec,
            &stripped,
            &method,
            Duration::from_secs(self.config.proxy_default_timeout),
        );
        ctx.effective_timeout = Some(timeout);
        ctx.timeout_is_enforced = enforced;

        trace!(
            trace_id = %ctx.trace_id,
            api_id = %spec.api_id(),
            timeout_secs = timeout.as_secs(),
            "Request filter complete, dispatching upstream"
        );
        Ok(false)
    }

    /// Buffer and rewrite the request body when a transform is planned.
    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        if ctx.request_body_transform.is_none() {
            return Ok(());
        }

        if let Some(chunk) = body.take() {
            ctx.request_body_buffer.extend_from_slice(&chunk);
        }
        if end_of_stream {
            let transformed = ctx
                .request_body_transform
                .take()
                .and_then(|rules| {
                    pipeline::transforms::apply_body_transform(
                        &rules,
                        &ctx.request_body_buffer,
                    )
                })
                .unwrap_or_else(|| Bytes::copy_from_slice(&ctx.request_body_buffer));
            ctx.request_body_buffer.clear();
            *body = Some(transformed);
        }
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        let Some(spec) = ctx.api.clone() else {
            return Err(Error::explain(
                ErrorType::HTTPStatus(404),
                "No API matched for request",
            ));
        };

        let target = spec.select_target();
        ctx.upstream_address = Some(target.address());
        ctx.upstream_base_path = target.base_path.clone();

        let timeout = ctx
            .effective_timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.proxy_default_timeout));
        let peer = build_peer(&spec, target, timeout);

        debug!(
            trace_id = %ctx.trace_id,
            api_id = %spec.api_id(),
            peer = %target.address(),
            tls = target.scheme_https,
            "Selected upstream target"
        );
        Ok(Box::new(peer))
    }

    /// Apply the outbound plan: URL join, method transform, header
    /// discipline, forwarding headers.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut pingora::http::RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let outbound_path = ctx
            .outbound_path
            .clone()
            .unwrap_or_else(|| ctx.path.clone());
        let joined = single_joining_slash(&ctx.upstream_base_path, &outbound_path, false);
        let path = if joined.starts_with('/') {
            joined
        } else {
            format!("/{}", joined)
        };
        let uri_string = match &ctx.query {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        match &ctx.outbound_method {
            // A method transform needs a rebuilt header; headers carry over
            Some(method) => {
                let mut rebuilt = pingora::http::RequestHeader::build(
                    method.as_str(),
                    uri_string.as_bytes(),
                    None,
                )?;
                for (name, value) in upstream_request.headers.iter() {
                    rebuilt
                        .append_header(name.as_str().to_string(), value.clone())
                        .ok();
                }
                *upstream_request = rebuilt;
            }
            None => {
                if let Ok(uri) = uri_string.parse::<http::Uri>() {
                    upstream_request.set_uri(uri);
                } else {
                    warn!(
                        trace_id = %ctx.trace_id,
                        uri = %uri_string,
                        "Joined upstream URI does not parse"
                    );
                }
            }
        }

        // Hop-by-hop discipline (the upgrade pair stays for WebSocket)
        for name in ["connection", "keep-alive", "te", "trailers", "proxy-authorization"] {
            if !(ctx.is_websocket_upgrade && name == "connection") {
                upstream_request.remove_header(name);
            }
        }

        // Planned header transforms
        for name in &ctx.request_header_remove {
            upstream_request.remove_header(name.as_str());
        }
        for (name, value) in &ctx.request_header_add {
            upstream_request.insert_header(name.clone(), value.as_str()).ok();
        }

        // A transformed body changes length; let the proxy re-frame it
        if ctx.request_body_transform.is_some() {
            upstream_request.remove_header("content-length");
        }

        // Forwarding headers
        let client_host = ctx
            .client_ip
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| ctx.client_ip.clone());
        let xff = match upstream_request
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, client_host),
            None => client_host,
        };
        upstream_request.insert_header("X-Forwarded-For", xff.as_str()).ok();
        upstream_request
            .insert_header("X-Trace-Id", ctx.trace_id.as_str())
            .ok();

        Ok(())
    }

    /// Response pipeline: transforms, limit headers, CORS discipline,
    /// breaker accounting and cache capture.
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        let status = upstream_response.status.as_u16();
        ctx.captured_status = status;

        // Gateway-injected headers win over upstream CORS duplicates
        for (name, _) in &ctx.response_header_add {
            if crate::pipeline::cors::CORS_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                upstream_response.remove_header(name.as_str());
            }
        }
        for name in &ctx.response_header_remove {
            upstream_response.remove_header(name.as_str());
        }
        for (name, value) in &ctx.response_header_add {
            upstream_response.insert_header(name.clone(), value.as_str())?;
        }

        // Custom response-slot handlers, in declared order
        if let Some(spec) = ctx.api.as_ref() {
            let hooks = &spec.def.custom_middleware.response;
            if !hooks.is_empty() {
                let current: Vec<(String, String)> = upstream_response
                    .headers
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let injected = pipeline::run_response_slot(
                    hooks,
                    &self.deps.drivers,
                    status,
                    &current,
                    &ctx.trace_id,
                )
                .await;
                for (name, value) in injected {
                    upstream_response.insert_header(name, value.as_str())?;
                }
            }
        }

        // Limit headers: quota state wins when both are present
        if let Some(info) = ctx.quota_info.or(ctx.rate_info) {
            upstream_response.insert_header("X-RateLimit-Limit", info.limit.to_string())?;
            upstream_response
                .insert_header("X-RateLimit-Remaining", info.remaining.to_string())?;
            upstream_response
                .insert_header("X-RateLimit-Reset", info.reset_at.to_string())?;
        }

        upstream_response.insert_header("X-Trace-Id", ctx.trace_id.as_str())?;

        // A planned response body transform needs the whole body; the
        // length changes, so the proxy re-frames the response
        if ctx.response_body_transform.is_some() {
            ctx.buffer_response = true;
            upstream_response.remove_header("content-length");
        }

        // Circuit breaker sampling: any 5xx counts as failure
        if let Some(breaker) = &ctx.breaker {
            let success = status < 500;
            if let Some(event) = breaker.record(success) {
                self.emit_breaker_event(ctx, event);
            }
        }

        // Cache capture: only responses the API declares cacheable are
        // stored; everything else releases the single-flight latch
        if ctx.cache_guard.is_some() {
            let cacheable_status = ctx
                .api
                .as_ref()
                .map(|spec| spec.def.cache_options.response_codes.contains(&status))
                .unwrap_or(false);
            if cacheable_status {
                ctx.captured_headers = upstream_response
                    .headers
                    .iter()
                    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
            } else {
                trace!(
                    trace_id = %ctx.trace_id,
                    status = status,
                    "Response not cacheable, releasing fetch latch"
                );
                ctx.cache_guard = None;
                // A pending body transform still needs the buffer
                ctx.buffer_response = ctx.response_body_transform.is_some();
            }
        }

        Ok(())
    }

    /// Response body processors: buffer once, transform when planned, and
    /// let the cache writer store the final bytes last.
    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>, Box<Error>> {
        let transforming = ctx.response_body_transform.is_some();

        if let Some(chunk) = body.as_ref() {
            ctx.response_bytes += chunk.len() as u64;
            if ctx.buffer_response {
                ctx.body_buffer.extend_from_slice(chunk);
            }
        }
        if transforming && !end_of_stream {
            // Held back until the whole body arrived
            *body = None;
            return Ok(None);
        }

        if end_of_stream {
            let mut final_body = Bytes::copy_from_slice(&ctx.body_buffer);
            if let Some(rules) = ctx.response_body_transform.take() {
                if let Some(changed) =
                    pipeline::transforms::apply_body_transform(&rules, &ctx.body_buffer)
                {
                    final_body = changed;
                }
                ctx.response_bytes = final_body.len() as u64;
                *body = Some(final_body.clone());
            }

            if let Some(guard) = ctx.cache_guard.take() {
                let ttl = ctx.cache_ttl.unwrap_or(Duration::from_secs(60));
                guard.store(
                    ctx.captured_status,
                    std::mem::take(&mut ctx.captured_headers),
                    final_body,
                    ttl,
                );
                self.deps.metrics.record_cache_event("store");
            }
        }
        Ok(None)
    }

    /// Map proxy failures to client responses. An enforced timeout gets
    /// the fixed 504 body; breaker accounting records the failure.
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> pingora_proxy::FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        if let Some(breaker) = &ctx.breaker {
            if let Some(event) = breaker.record(false) {
                self.emit_breaker_event(ctx, event);
            }
        }

        let error_code = match e.etype() {
            ErrorType::ReadTimedout | ErrorType::WriteTimedout | ErrorType::ConnectTimedout => {
                504
            }
            ErrorType::ConnectRefused => 503,
            ErrorType::ConnectNoRoute => 502,
            ErrorType::TLSHandshakeFailure | ErrorType::InvalidCert => 502,
            ErrorType::InvalidHTTPHeader => 400,
            ErrorType::H2Error => 502,
            ErrorType::ConnectProxyFailure | ErrorType::ConnectionClosed => 502,
            ErrorType::HTTPStatus(code) => *code,
            ErrorType::InternalError => 500,
            _ => 502,
        };

        error!(
            trace_id = %ctx.trace_id,
            api_id = ctx.api_id().unwrap_or("unknown"),
            upstream = ctx.upstream_address.as_deref().unwrap_or("unknown"),
            error_type = ?e.etype(),
            error = %e,
            error_code = error_code,
            "Proxy error"
        );
        self.deps
            .metrics
            .record_blocked(&format!("proxy_error_{}", error_code));
        ctx.captured_status = error_code;

        // The enforced-timeout 504 carries a fixed body
        if error_code == 504 {
            let written = super::http::write_error(
                session,
                504,
                HARD_TIMEOUT_BODY,
                "text/plain; charset=utf-8",
            )
            .await;
            if written.is_ok() {
                return pingora_proxy::FailToProxy {
                    error_code: 0,
                    can_reuse_downstream: false,
                };
            }
        }

        pingora_proxy::FailToProxy {
            error_code,
            can_reuse_downstream: error_code < 500,
        }
    }

    /// Always runs on request exit: drain accounting, metrics, analytics.
    async fn logging(&self, session: &mut Session, _error: Option<&Error>, ctx: &mut Self::CTX) {
        if ctx.drain_counted {
            self.drain.dec_requests();
        }

        let duration = ctx.elapsed();
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(ctx.captured_status);
        let api_id = ctx.api_id().unwrap_or("none").to_string();

        self.deps
            .metrics
            .record_request(&api_id, &ctx.method, status, duration);

        if self.analytics.is_enabled() {
            let record = AnalyticsRecord {
                timestamp: Utc::now().to_rfc3339(),
                trace_id: ctx.trace_id.clone(),
                api_id: ctx.api_id().map(|s| s.to_string()),
                org_id: ctx
                    .api
                    .as_ref()
                    .map(|spec| spec.def.org_id.clone())
                    .filter(|o| !o.is_empty()),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                host: ctx.host.clone(),
                status,
                latency_ms: duration.as_millis() as u64,
                client_ip: ctx.client_ip.clone(),
                key_hash: ctx.key_hash.clone(),
                version: ctx.version_name.clone(),
                cached: ctx.served_from_cache,
                blocked_reason: ctx.blocked_reason.clone(),
                response_bytes: ctx.response_bytes,
                upstream: ctx.upstream_address.clone(),
            };
            self.analytics.record(&record);
        }

        if status >= 500 {
            error!(
                trace_id = %ctx.trace_id,
                api_id = %api_id,
                method = %ctx.method,
                path = %ctx.path,
                status = status,
                duration_ms = duration.as_millis() as u64,
                "Request completed with server error"
            );
        } else {
            info!(
                trace_id = %ctx.trace_id,
                api_id = %api_id,
                method = %ctx.method,
                path = %ctx.path,
                status = status,
                duration_ms = duration.as_millis() as u64,
                cached = ctx.served_from_cache,
                "Request completed"
            );
        }
    }
}

impl GantryGateway {
    fn emit_breaker_event(&self, ctx: &RequestContext, event: BreakerEvent) {
        let api_id = ctx.api_id().unwrap_or("unknown").to_string();
        let path = ctx
            .outbound_path
            .clone()
            .unwrap_or_else(|| ctx.path.clone());
        match event {
            BreakerEvent::Tripped => {
                self.deps.metrics.record_breaker_event(&api_id, "tripped");
                self.deps.notifier.emit(GatewayEvent::BreakerTripped {
                    api_id,
                    path,
                });
            }
            BreakerEvent::Reset => {
                self.deps.metrics.record_breaker_event(&api_id, "reset");
                self.deps.notifier.emit(GatewayEvent::BreakerReset {
                    api_id,
                    path,
                });
            }
        }
    }
}
