//! Authentication stage.
//!
//! Exactly one variant runs per API, dispatched by the definition's auth
//! mode. Success produces a [`SessionState`] in the context; failure
//! terminates the pipeline with 401. The `auth_check` custom slot replaces
//! the built-in variant when declared.

pub mod hmac_sig;
pub mod jwt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use gantry_common::{GatewayError, GatewayResult};
use gantry_config::{AuthMode, SessionState};

use crate::gateway::context::RequestContext;
use crate::registry::ApiSpec;

use super::{slots, PipelineDeps, RequestParts, StageDecision};

const KEY_NOT_FOUND: &str = "Access to this API has been disallowed";
const KEY_MISSING: &str = "Authorization field missing";
const KEY_EXPIRED: &str = "Key has expired, please renew";

/// Extract the presented key per the API's auth configuration.
fn extract_key(spec: &ApiSpec, parts: &RequestParts) -> Option<String> {
    let auth = &spec.def.auth;

    let mut raw = parts
        .header(&auth.auth_header_name)
        .map(|v| v.to_string())
        .or_else(|| {
            auth.param_name
                .as_deref()
                .and_then(|name| parts.query_param(name))
        })
        .or_else(|| {
            auth.cookie_name
                .as_deref()
                .and_then(|name| parts.cookie(name))
        })?;

    if auth.strip_authorization_scheme {
        if let Some((_, rest)) = raw.split_once(' ') {
            raw = rest.trim().to_string();
        }
    }
    (!raw.is_empty()).then_some(raw)
}

/// Fetch, check and policy-apply the session for a presented key.
pub(crate) async fn load_session(
    deps: &PipelineDeps,
    raw_key: &str,
) -> GatewayResult<SessionState> {
    let Some(mut session) = deps.sessions.get(raw_key).await? else {
        return Err(GatewayError::auth(KEY_NOT_FOUND));
    };
    if session.is_inactive {
        return Err(GatewayError::auth(KEY_NOT_FOUND));
    }
    if session.is_expired(Utc::now().timestamp()) {
        return Err(GatewayError::auth(KEY_EXPIRED));
    }
    session.apply_policies(&deps.policies.get())?;
    Ok(session)
}

fn install_session(
    deps: &PipelineDeps,
    ctx: &mut RequestContext,
    raw_key: String,
    session: SessionState,
) {
    ctx.key_hash = Some(deps.sessions.storage_id(&raw_key));
    ctx.session_key = Some(raw_key);
    ctx.session = Some(session);
}

pub async fn apply(
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    if ctx.ignore_auth {
        return Ok(StageDecision::Continue);
    }

    // A declared auth_check handler replaces the built-in variant
    if let Some(hook) = &spec.def.custom_middleware.auth_check {
        let decision =
            slots::run_slot(std::slice::from_ref(hook), deps, parts, ctx).await?;
        if ctx.session.is_some() && ctx.key_hash.is_none() {
            let session = ctx.session.as_ref().map(|s| s.alias.clone());
            let alias = session.filter(|a| !a.is_empty()).unwrap_or_else(|| {
                format!("custom-{}", ctx.trace_id)
            });
            ctx.key_hash = Some(deps.sessions.storage_id(&alias));
        }
        if ctx.session.is_none() {
            if let StageDecision::Continue = decision {
                return Err(GatewayError::auth(KEY_NOT_FOUND));
            }
        }
        return Ok(decision);
    }

    match spec.def.auth.mode {
        AuthMode::Keyless => {
            ctx.session = Some(SessionState::default());
            Ok(StageDecision::Continue)
        }
        AuthMode::Token | AuthMode::Oauth2 => {
            let Some(raw_key) = extract_key(spec, parts) else {
                return Err(GatewayError::auth(KEY_MISSING));
            };
            let session = load_session(deps, &raw_key).await?;
            debug!(trace_id = %ctx.trace_id, api_id = %spec.api_id(), "Key authenticated");
            install_session(deps, ctx, raw_key, session);
            Ok(StageDecision::Continue)
        }
        AuthMode::Basic => basic_auth(spec, deps, parts, ctx).await,
        AuthMode::Hmac => hmac_sig::apply(spec, deps, parts, ctx).await,
        AuthMode::Jwt => jwt::apply(spec, deps, parts, ctx, false).await,
        AuthMode::Openid => jwt::apply(spec, deps, parts, ctx, true).await,
        AuthMode::Mtls => mtls_auth(spec, deps, parts, ctx).await,
        AuthMode::Custom => {
            // Custom mode without an auth_check handler cannot authenticate
            Err(GatewayError::auth(KEY_NOT_FOUND))
        }
    }
}

async fn basic_auth(
    _spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let Some(raw) = parts.header("authorization") else {
        return Err(GatewayError::auth(KEY_MISSING));
    };
    let Some(encoded) = raw.strip_prefix("Basic ") else {
        return Err(GatewayError::auth("Authorization header malformed"));
    };
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| GatewayError::auth("Authorization header malformed"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| GatewayError::auth("Authorization header malformed"))?;
    let Some((username, password)) = decoded.split_once(':') else {
        return Err(GatewayError::auth("Authorization header malformed"));
    };

    let session = load_session(deps, username).await?;

    let Some(stored_hash) = session.basic_auth_hash.as_deref() else {
        return Err(GatewayError::auth(KEY_NOT_FOUND));
    };
    let presented = Sha256::digest(password.as_bytes());
    let presented_hex: String = presented.iter().map(|b| format!("{:02x}", b)).collect();
    if presented_hex
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .unwrap_u8()
        != 1
    {
        return Err(GatewayError::auth(KEY_NOT_FOUND));
    }

    install_session(deps, ctx, username.to_string(), session);
    Ok(StageDecision::Continue)
}

async fn mtls_auth(
    _spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let Some(fingerprint) = parts.client_cert_fingerprint.as_deref() else {
        return Err(GatewayError::auth("Client certificate required"));
    };
    if deps.certs.lookup(fingerprint).is_none() {
        return Err(GatewayError::auth("Certificate is not recognized"));
    }
    let session = load_session(deps, fingerprint).await?;
    install_session(deps, ctx, fingerprint.to_string(), session);
    Ok(StageDecision::Continue)
}
