//! Authorization: evaluates the session's access rights for the matched
//! API, version, URL and method.

use std::sync::Arc;
use tracing::debug;

use gantry_common::{GatewayError, GatewayResult};
use regex::Regex;

use crate::gateway::context::RequestContext;
use crate::registry::ApiSpec;

use super::{RequestParts, StageDecision};

pub fn apply(
    spec: &Arc<ApiSpec>,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    if ctx.ignore_auth {
        return Ok(StageDecision::Continue);
    }
    let Some(session) = ctx.session.as_ref() else {
        return Ok(StageDecision::Continue);
    };

    // A session with no rights at all is an unrestricted legacy key
    if session.access_rights.is_empty() {
        return Ok(StageDecision::Continue);
    }

    let Some(grant) = session.access_for(spec.api_id()) else {
        debug!(
            trace_id = %ctx.trace_id,
            api_id = %spec.api_id(),
            "Session has no grant for this API"
        );
        return Err(GatewayError::forbidden(
            "Access to this API has been disallowed",
        ));
    };

    if let Some(version) = ctx.version_name.as_deref() {
        if !grant.versions.is_empty() && !grant.versions.iter().any(|v| v == version) {
            return Err(GatewayError::forbidden(
                "Access to this API has been disallowed",
            ));
        }
    }

    if !grant.allowed_urls.is_empty() {
        let stripped = spec.strip_path(&parts.path);
        let allowed = grant.allowed_urls.iter().any(|spec_url| {
            let method_ok = spec_url.methods.is_empty()
                || spec_url
                    .methods
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(&parts.method));
            method_ok
                && Regex::new(&spec_url.url)
                    .map(|re| re.is_match(stripped))
                    .unwrap_or(false)
        });
        if !allowed {
            return Err(GatewayError::forbidden(
                "Access to this resource has been disallowed",
            ));
        }
    }

    Ok(StageDecision::Continue)
}
