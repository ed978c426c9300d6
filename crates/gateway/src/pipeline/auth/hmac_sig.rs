//! HMAC signature authentication.
//!
//! Validates draft-cavage style `Signature` authorization headers:
//! `Signature keyId="...",algorithm="hmac-sha256",headers="...",
//! signature="..."`. The signing string is rebuilt from the listed headers;
//! the shared secret comes from the key's session. A `Date` header outside
//! the allowed clock skew is refused.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use gantry_common::{GatewayError, GatewayResult};

use crate::gateway::context::RequestContext;
use crate::registry::ApiSpec;

use super::{install_session, load_session};
use crate::pipeline::{PipelineDeps, RequestParts, StageDecision};

const SIGNATURE_MALFORMED: &str = "Authorization field malformed";
const SIGNATURE_INVALID: &str = "Request signature verification failed";

/// Parsed `Signature` header fields.
#[derive(Debug, PartialEq)]
struct SignatureFields {
    key_id: String,
    algorithm: String,
    headers: Vec<String>,
    signature: String,
}

fn parse_signature(raw: &str) -> Option<SignatureFields> {
    let body = raw.strip_prefix("Signature ")?;
    let mut fields: HashMap<String, String> = HashMap::new();
    for part in body.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        fields.insert(
            key.to_ascii_lowercase(),
            value.trim_matches('"').to_string(),
        );
    }
    Some(SignatureFields {
        key_id: fields.remove("keyid")?,
        algorithm: fields.remove("algorithm")?,
        headers: fields
            .remove("headers")
            .map(|h| h.split(' ').map(|s| s.to_ascii_lowercase()).collect())
            .unwrap_or_else(|| vec!["date".to_string()]),
        signature: fields.remove("signature")?,
    })
}

fn signing_string(
    fields: &SignatureFields,
    parts: &RequestParts,
) -> GatewayResult<String> {
    let mut lines = Vec::with_capacity(fields.headers.len());
    for header in &fields.headers {
        if header == "(request-target)" {
            let target = match &parts.query {
                Some(query) => format!("{}?{}", parts.path, query),
                None => parts.path.clone(),
            };
            lines.push(format!(
                "(request-target): {} {}",
                parts.method.to_ascii_lowercase(),
                target
            ));
        } else {
            let value = parts
                .header(header)
                .ok_or_else(|| GatewayError::auth(SIGNATURE_MALFORMED))?;
            lines.push(format!("{}: {}", header, value));
        }
    }
    Ok(lines.join("\n"))
}

fn compute_signature(algorithm: &str, secret: &str, payload: &str) -> GatewayResult<Vec<u8>> {
    match algorithm {
        "hmac-sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|_| GatewayError::auth(SIGNATURE_INVALID))?;
            mac.update(payload.as_bytes());
            Ok(mac.finalize().into_bytes().to_vec())
        }
        "hmac-sha512" => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
                .map_err(|_| GatewayError::auth(SIGNATURE_INVALID))?;
            mac.update(payload.as_bytes());
            Ok(mac.finalize().into_bytes().to_vec())
        }
        _ => Err(GatewayError::auth(SIGNATURE_MALFORMED)),
    }
}

fn check_clock_skew(parts: &RequestParts, allowed_ms: u64) -> GatewayResult<()> {
    let Some(date) = parts.header("date") else {
        return Ok(());
    };
    let parsed = DateTime::parse_from_rfc2822(date)
        .map_err(|_| GatewayError::auth(SIGNATURE_MALFORMED))?;
    let skew = (Utc::now().timestamp_millis() - parsed.timestamp_millis()).unsigned_abs();
    if allowed_ms > 0 && skew > allowed_ms {
        return Err(GatewayError::auth(SIGNATURE_INVALID));
    }
    Ok(())
}

pub async fn apply(
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let Some(raw) = parts.header("authorization") else {
        return Err(GatewayError::auth("Authorization field missing"));
    };
    let Some(fields) = parse_signature(raw) else {
        return Err(GatewayError::auth(SIGNATURE_MALFORMED));
    };

    let allowed = &spec.def.auth.hmac_allowed_algorithms;
    if !allowed.is_empty() && !allowed.iter().any(|a| a == &fields.algorithm) {
        return Err(GatewayError::auth(SIGNATURE_MALFORMED));
    }

    check_clock_skew(parts, spec.def.auth.hmac_allowed_clock_skew_ms)?;

    let session = load_session(deps, &fields.key_id).await?;
    let Some(secret) = session.hmac_secret.as_deref() else {
        return Err(GatewayError::auth(SIGNATURE_INVALID));
    };

    let payload = signing_string(&fields, parts)?;
    let expected = compute_signature(&fields.algorithm, secret, &payload)?;
    let presented = BASE64
        .decode(&fields.signature)
        .map_err(|_| GatewayError::auth(SIGNATURE_MALFORMED))?;

    if expected.ct_eq(&presented).unwrap_u8() != 1 {
        debug!(trace_id = %ctx.trace_id, key_id = %fields.key_id, "HMAC signature mismatch");
        return Err(GatewayError::auth(SIGNATURE_INVALID));
    }

    install_session(deps, ctx, fields.key_id, session);
    Ok(StageDecision::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{deps_for_tests, parts_for, spec_from_json};
    use gantry_config::SessionState;

    fn hmac_spec() -> Arc<ApiSpec> {
        spec_from_json(
            r#"{"api_id":"sig","name":"sig","listen_path":"/sig/",
                "target_urls":["http://u/"],
                "auth":{"mode":"hmac","hmac_allowed_algorithms":["hmac-sha256"]}}"#,
        )
    }

    fn sign(secret: &str, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn parses_signature_header() {
        let fields = parse_signature(
            r#"Signature keyId="my-key",algorithm="hmac-sha256",headers="(request-target) date",signature="abc==""#,
        )
        .unwrap();
        assert_eq!(fields.key_id, "my-key");
        assert_eq!(fields.algorithm, "hmac-sha256");
        assert_eq!(fields.headers, vec!["(request-target)", "date"]);
        assert_eq!(fields.signature, "abc==");
    }

    #[test]
    fn headers_default_to_date() {
        let fields = parse_signature(
            r#"Signature keyId="k",algorithm="hmac-sha256",signature="s""#,
        )
        .unwrap();
        assert_eq!(fields.headers, vec!["date"]);
    }

    #[tokio::test]
    async fn valid_signature_authenticates() {
        let spec = hmac_spec();
        let deps = deps_for_tests();
        deps.sessions
            .put(
                "signer",
                &SessionState {
                    hmac_secret: Some("topsecret".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let date = Utc::now().to_rfc2822();
        let payload = format!("date: {}", date);
        let signature = sign("topsecret", &payload);
        let header = format!(
            r#"Signature keyId="signer",algorithm="hmac-sha256",headers="date",signature="{}""#,
            signature
        );

        let parts = parts_for(
            "GET",
            "/sig/x",
            &[("Authorization", &header), ("Date", &date)],
        );
        let mut ctx = RequestContext::new();

        apply(&spec, &deps, &parts, &mut ctx).await.unwrap();
        assert!(ctx.session.is_some());
    }

    #[tokio::test]
    async fn tampered_signature_is_refused() {
        let spec = hmac_spec();
        let deps = deps_for_tests();
        deps.sessions
            .put(
                "signer",
                &SessionState {
                    hmac_secret: Some("topsecret".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let date = Utc::now().to_rfc2822();
        let payload = format!("date: {}", date);
        let signature = sign("wrong-secret", &payload);
        let header = format!(
            r#"Signature keyId="signer",algorithm="hmac-sha256",headers="date",signature="{}""#,
            signature
        );

        let parts = parts_for(
            "GET",
            "/sig/x",
            &[("Authorization", &header), ("Date", &date)],
        );
        let mut ctx = RequestContext::new();

        let err = apply(&spec, &deps, &parts, &mut ctx).await.unwrap_err();
        assert_eq!(err.to_http_status(), 401);
    }

    #[tokio::test]
    async fn disallowed_algorithm_is_refused() {
        let spec = hmac_spec();
        let deps = deps_for_tests();

        let header = r#"Signature keyId="k",algorithm="hmac-sha512",signature="x""#;
        let parts = parts_for("GET", "/sig/x", &[("Authorization", header)]);
        let mut ctx = RequestContext::new();

        assert!(apply(&spec, &deps, &parts, &mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn stale_date_is_refused() {
        let spec = hmac_spec();
        let deps = deps_for_tests();
        deps.sessions
            .put(
                "signer",
                &SessionState {
                    hmac_secret: Some("topsecret".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc2822();
        let payload = format!("date: {}", stale);
        let signature = sign("topsecret", &payload);
        let header = format!(
            r#"Signature keyId="signer",algorithm="hmac-sha256",headers="date",signature="{}""#,
            signature
        );

        let parts = parts_for(
            "GET",
            "/sig/x",
            &[("Authorization", &header), ("Date", &stale)],
        );
        let mut ctx = RequestContext::new();

        assert!(apply(&spec, &deps, &parts, &mut ctx).await.is_err());
    }
}
