//! CORS handling.
//!
//! Preflight OPTIONS requests are answered by the gateway unless the API
//! opts into passthrough; simple requests get the response headers queued
//! for injection. The reverse proxy deduplicates against upstream CORS
//! headers (gateway-injected values win).

use std::sync::Arc;

use gantry_common::GatewayResult;
use gantry_config::CorsConfig;

use crate::gateway::context::RequestContext;
use crate::registry::ApiSpec;

use super::{RequestParts, StageDecision, TerminalResponse};

/// The headers the gateway owns when CORS is enabled.
pub const CORS_HEADERS: [&str; 6] = [
    "Access-Control-Allow-Origin",
    "Access-Control-Allow-Methods",
    "Access-Control-Allow-Headers",
    "Access-Control-Expose-Headers",
    "Access-Control-Allow-Credentials",
    "Access-Control-Max-Age",
];

fn origin_allowed(config: &CorsConfig, origin: &str) -> bool {
    config.allowed_origins.is_empty()
        || config
            .allowed_origins
            .iter()
            .any(|o| o == "*" || o == origin)
}

fn build_headers(config: &CorsConfig, origin: Option<&str>) -> Vec<(String, String)> {
    let mut headers = Vec::new();

    let allow_origin = match origin {
        Some(origin) if config.allowed_origins.iter().any(|o| o == origin) => {
            origin.to_string()
        }
        _ if config.allowed_origins.is_empty() => "*".to_string(),
        _ => config
            .allowed_origins
            .first()
            .cloned()
            .unwrap_or_else(|| "*".to_string()),
    };
    headers.push(("Access-Control-Allow-Origin".to_string(), allow_origin));

    if !config.allowed_methods.is_empty() {
        headers.push((
            "Access-Control-Allow-Methods".to_string(),
            config.allowed_methods.join(", "),
        ));
    }
    if !config.allowed_headers.is_empty() {
        headers.push((
            "Access-Control-Allow-Headers".to_string(),
            config.allowed_headers.join(", "),
        ));
    }
    if !config.exposed_headers.is_empty() {
        headers.push((
            "Access-Control-Expose-Headers".to_string(),
            config.exposed_headers.join(", "),
        ));
    }
    if config.allow_credentials {
        headers.push((
            "Access-Control-Allow-Credentials".to_string(),
            "true".to_string(),
        ));
    }
    if config.max_age > 0 {
        headers.push((
            "Access-Control-Max-Age".to_string(),
            config.max_age.to_string(),
        ));
    }
    headers
}

pub fn apply(
    spec: &Arc<ApiSpec>,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let config = &spec.def.cors;
    let origin = parts.header("origin");

    if let Some(origin) = origin {
        if !origin_allowed(config, origin) {
            // Not a CORS error response: the browser enforces the absence
            // of the headers; the request itself proceeds
            return Ok(StageDecision::Continue);
        }
    }

    let headers = build_headers(config, origin);

    if parts.method.eq_ignore_ascii_case("OPTIONS") && !config.options_passthrough {
        return Ok(StageDecision::Terminate(TerminalResponse {
            status: 204,
            headers,
            body: bytes::Bytes::new(),
        }));
    }

    ctx.response_header_add.extend(headers);
    Ok(StageDecision::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{parts_for, spec_from_json};

    fn cors_spec(passthrough: bool) -> Arc<ApiSpec> {
        spec_from_json(&format!(
            r#"{{"api_id":"cors","name":"cors","listen_path":"/c/",
                "target_urls":["http://u/"],
                "cors": {{
                    "enabled": true,
                    "allowed_origins": ["https://app.example.com"],
                    "allowed_methods": ["GET", "POST"],
                    "max_age": 600,
                    "options_passthrough": {}
                }} }}"#,
            passthrough
        ))
    }

    #[test]
    fn preflight_is_answered_by_the_gateway() {
        let spec = cors_spec(false);
        let parts = parts_for(
            "OPTIONS",
            "/c/x",
            &[("Origin", "https://app.example.com")],
        );
        let mut ctx = RequestContext::new();

        let StageDecision::Terminate(response) = apply(&spec, &parts, &mut ctx).unwrap()
        else {
            panic!("preflight must short-circuit");
        };
        assert_eq!(response.status, 204);
        assert!(response
            .headers
            .iter()
            .any(|(name, value)| name == "Access-Control-Allow-Origin"
                && value == "https://app.example.com"));
        assert!(response
            .headers
            .iter()
            .any(|(name, _)| name == "Access-Control-Max-Age"));
    }

    #[test]
    fn preflight_passes_through_when_configured() {
        let spec = cors_spec(true);
        let parts = parts_for(
            "OPTIONS",
            "/c/x",
            &[("Origin", "https://app.example.com")],
        );
        let mut ctx = RequestContext::new();

        assert!(matches!(
            apply(&spec, &parts, &mut ctx).unwrap(),
            StageDecision::Continue
        ));
        // Headers still queued for the response
        assert!(!ctx.response_header_add.is_empty());
    }

    #[test]
    fn simple_request_queues_headers() {
        let spec = cors_spec(false);
        let parts = parts_for("GET", "/c/x", &[("Origin", "https://app.example.com")]);
        let mut ctx = RequestContext::new();

        assert!(matches!(
            apply(&spec, &parts, &mut ctx).unwrap(),
            StageDecision::Continue
        ));
        assert!(ctx
            .response_header_add
            .iter()
            .any(|(name, _)| name == "Access-Control-Allow-Origin"));
    }
}
