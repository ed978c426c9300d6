//! Version resolution and path classification.
//!
//! Resolves the requested version from a header, query parameter or the
//! first path segment, then classifies the (stripped) path against the
//! version's allow/ignore/block lists.

use chrono::Utc;
use std::sync::Arc;
use tracing::trace;

use gantry_common::{GatewayError, GatewayResult};
use gantry_config::VersionLocation;

use crate::gateway::context::RequestContext;
use crate::registry::{ApiSpec, PathStatus};

use super::{RequestParts, StageDecision};

fn resolve_version_name(spec: &ApiSpec, parts: &RequestParts, stripped: &str) -> String {
    let config = &spec.def.version_config;
    let resolved = match config.location {
        VersionLocation::Header => parts.header(&config.key).map(|v| v.to_string()),
        VersionLocation::UrlParam => parts.query_param(&config.key),
        VersionLocation::Url => stripped
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
    };
    resolved.unwrap_or_else(|| config.default.clone())
}

pub fn apply(
    spec: &Arc<ApiSpec>,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    if spec.def.version_config.not_versioned || !spec.has_versions() {
        return Ok(StageDecision::Continue);
    }

    let stripped = spec.strip_path(&parts.path);
    let name = resolve_version_name(spec, parts, stripped);

    let Some(version) = spec.version(&name) else {
        return Err(GatewayError::forbidden(
            "This API version does not seem to exist",
        ));
    };
    if version.is_expired(Utc::now()) {
        return Err(GatewayError::forbidden(
            "Api Version has expired, please check documentation or contact administrator",
        ));
    }

    ctx.version_name = Some(name.clone());

    match version.classify(stripped, &parts.method) {
        PathStatus::Blocked | PathStatus::NotListed => {
            Err(GatewayError::forbidden("Requested endpoint is forbidden"))
        }
        PathStatus::Ignored => {
            trace!(trace_id = %ctx.trace_id, path = %stripped, "Path on ignore list, skipping auth");
            ctx.ignore_auth = true;
            Ok(StageDecision::Continue)
        }
        PathStatus::Allowed => Ok(StageDecision::Continue),
    }
}
