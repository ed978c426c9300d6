//! JWT and OpenID Connect authentication.
//!
//! The token is validated against the API's configured secret or public
//! key. The identity claim addresses the session; the policy claim (or the
//! configured defaults) decides which policies apply to it. OpenID mode
//! additionally checks the issuer and client id against allow-lists.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use std::sync::Arc;
use tracing::debug;

use gantry_common::{GatewayError, GatewayResult};
use gantry_config::SessionState;

use crate::gateway::context::RequestContext;
use crate::registry::ApiSpec;

use super::{extract_key, install_session};
use crate::pipeline::{PipelineDeps, RequestParts, StageDecision};

const TOKEN_INVALID: &str = "Key not authorized";

fn decoding_key(spec: &ApiSpec, algorithm: Algorithm) -> GatewayResult<DecodingKey> {
    let source = &spec.def.auth.jwt.source;
    if source.is_empty() {
        return Err(GatewayError::auth(TOKEN_INVALID));
    }
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            let secret = BASE64
                .decode(source)
                .unwrap_or_else(|_| source.as_bytes().to_vec());
            Ok(DecodingKey::from_secret(&secret))
        }
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            DecodingKey::from_rsa_pem(source.as_bytes())
                .map_err(|_| GatewayError::auth(TOKEN_INVALID))
        }
        _ => Err(GatewayError::auth(TOKEN_INVALID)),
    }
}

fn claim_string(claims: &serde_json::Value, name: &str) -> Option<String> {
    claims.get(name).and_then(|v| v.as_str()).map(String::from)
}

fn claim_policies(claims: &serde_json::Value, name: &str) -> Vec<String> {
    match claims.get(name) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

pub async fn apply(
    spec: &Arc<ApiSpec>,
    deps: &PipelineDeps,
    parts: &RequestParts,
    ctx: &mut RequestContext,
    openid: bool,
) -> GatewayResult<StageDecision> {
    let Some(token) = extract_key(spec, parts) else {
        return Err(GatewayError::auth("Authorization field missing"));
    };
    let token = token
        .strip_prefix("Bearer ")
        .map(str::trim)
        .unwrap_or(token.as_str())
        .to_string();

    let header =
        decode_header(&token).map_err(|_| GatewayError::auth(TOKEN_INVALID))?;
    let key = decoding_key(spec, header.alg)?;

    let jwt_config = &spec.def.auth.jwt;
    let mut validation = Validation::new(header.alg);
    validation.leeway = jwt_config.clock_skew;
    validation.validate_aud = false;

    let data = decode::<serde_json::Value>(&token, &key, &validation)
        .map_err(|e| {
            debug!(trace_id = %ctx.trace_id, error = %e, "JWT validation failed");
            GatewayError::auth(TOKEN_INVALID)
        })?;
    let claims = data.claims;

    if openid {
        let openid_config = &spec.def.auth.openid;
        if !openid_config.issuers.is_empty() {
            let issuer = claim_string(&claims, "iss").unwrap_or_default();
            if !openid_config.issuers.iter().any(|i| *i == issuer) {
                return Err(GatewayError::auth(TOKEN_INVALID));
            }
        }
        if !openid_config.client_ids.is_empty() {
            let audience = claim_string(&claims, "aud").unwrap_or_default();
            if !openid_config.client_ids.iter().any(|c| *c == audience) {
                return Err(GatewayError::auth(TOKEN_INVALID));
            }
        }
    }

    let identity_claim = &jwt_config.identity_claim;
    let Some(identity) = claim_string(&claims, identity_claim) else {
        return Err(GatewayError::auth(TOKEN_INVALID));
    };

    // An existing session for the identity is reused; otherwise one is
    // synthesized and shaped entirely by policies.
    let mut session = deps
        .sessions
        .get(&identity)
        .await?
        .unwrap_or_else(SessionState::default);

    let mut policies = if jwt_config.policy_claim.is_empty() {
        Vec::new()
    } else {
        claim_policies(&claims, &jwt_config.policy_claim)
    };
    if policies.is_empty() {
        policies = jwt_config.default_policies.clone();
    }
    if !policies.is_empty() {
        session.apply_policies = policies;
        session.apply_policies(&deps.policies.get())?;
    }

    debug!(trace_id = %ctx.trace_id, identity = %identity, "JWT authenticated");
    install_session(deps, ctx, identity, session);
    Ok(StageDecision::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{deps_for_tests, parts_for, spec_from_json};
    use gantry_config::Policy;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::collections::HashMap;

    const SECRET: &str = "hs256-unit-test-secret";

    fn jwt_spec(policy_claim: &str) -> Arc<ApiSpec> {
        let encoded = BASE64.encode(SECRET);
        spec_from_json(&format!(
            r#"{{"api_id":"jwt","name":"jwt","listen_path":"/jwt/",
                "target_urls":["http://u/"],
                "auth":{{"mode":"jwt","strip_authorization_scheme":true,
                    "jwt":{{"source":"{}","signing_method":"hmac",
                        "identity_claim":"sub","policy_claim":"{}"}}}}}}"#,
            encoded, policy_claim
        ))
    }

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn valid_token_builds_session_from_policies() {
        let spec = jwt_spec("pol");
        let deps = deps_for_tests();

        let mut policies = HashMap::new();
        policies.insert(
            "gold".to_string(),
            Policy {
                id: "gold".to_string(),
                rate: 50.0,
                per: 60.0,
                quota_max: 1000,
                quota_renewal_rate: 3600,
                ..Default::default()
            },
        );
        deps.policies.replace(policies);

        let jwt = token(serde_json::json!({
            "sub": "user-1", "pol": "gold", "exp": future_exp()
        }));
        let parts = parts_for(
            "GET",
            "/jwt/x",
            &[("Authorization", &format!("Bearer {}", jwt))],
        );
        let mut ctx = RequestContext::new();

        apply(&spec, &deps, &parts, &mut ctx, false).await.unwrap();
        let session = ctx.session.unwrap();
        assert_eq!(session.rate, 50.0);
        assert_eq!(session.quota_max, 1000);
        assert_eq!(ctx.session_key.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn bad_signature_is_refused() {
        let spec = jwt_spec("pol");
        let deps = deps_for_tests();

        let forged = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "user-1", "exp": future_exp() }),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        let parts = parts_for(
            "GET",
            "/jwt/x",
            &[("Authorization", &format!("Bearer {}", forged))],
        );
        let mut ctx = RequestContext::new();

        let err = apply(&spec, &deps, &parts, &mut ctx, false)
            .await
            .unwrap_err();
        assert_eq!(err.to_http_status(), 401);
    }

    #[tokio::test]
    async fn expired_token_is_refused() {
        let spec = jwt_spec("pol");
        let deps = deps_for_tests();

        let jwt = token(serde_json::json!({
            "sub": "user-1",
            "exp": chrono::Utc::now().timestamp() - 600
        }));
        let parts = parts_for(
            "GET",
            "/jwt/x",
            &[("Authorization", &format!("Bearer {}", jwt))],
        );
        let mut ctx = RequestContext::new();

        assert!(apply(&spec, &deps, &parts, &mut ctx, false).await.is_err());
    }

    #[tokio::test]
    async fn missing_identity_claim_is_refused() {
        let spec = jwt_spec("pol");
        let deps = deps_for_tests();

        let jwt = token(serde_json::json!({ "exp": future_exp() }));
        let parts = parts_for(
            "GET",
            "/jwt/x",
            &[("Authorization", &format!("Bearer {}", jwt))],
        );
        let mut ctx = RequestContext::new();

        assert!(apply(&spec, &deps, &parts, &mut ctx, false).await.is_err());
    }

    #[tokio::test]
    async fn openid_checks_issuer() {
        let encoded = BASE64.encode(SECRET);
        let spec = spec_from_json(&format!(
            r#"{{"api_id":"oidc","name":"oidc","listen_path":"/oidc/",
                "target_urls":["http://u/"],
                "auth":{{"mode":"openid","strip_authorization_scheme":true,
                    "jwt":{{"source":"{}","identity_claim":"sub"}},
                    "openid":{{"issuers":["https://idp.example.com"]}}}}}}"#,
            encoded
        ));
        let deps = deps_for_tests();

        let good = token(serde_json::json!({
            "sub": "u", "iss": "https://idp.example.com", "exp": future_exp()
        }));
        let parts = parts_for(
            "GET",
            "/oidc/x",
            &[("Authorization", &format!("Bearer {}", good))],
        );
        let mut ctx = RequestContext::new();
        assert!(apply(&spec, &deps, &parts, &mut ctx, true).await.is_ok());

        let bad = token(serde_json::json!({
            "sub": "u", "iss": "https://rogue.example.com", "exp": future_exp()
        }));
        let parts = parts_for(
            "GET",
            "/oidc/x",
            &[("Authorization", &format!("Bearer {}", bad))],
        );
        let mut ctx = RequestContext::new();
        assert!(apply(&spec, &deps, &parts, &mut ctx, true).await.is_err());
    }
}
