//! Request transforms: URL rewrite, method transform, header injection.
//!
//! Transforms never touch the live request; they record an outbound plan in
//! the context that the proxy applies when building the upstream request.

use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

use gantry_common::GatewayResult;

use crate::gateway::context::RequestContext;
use crate::registry::{ApiSpec, CompiledBodyTransform};

use super::{RequestParts, StageDecision};

/// Apply a JSON body transform. Returns `None` when the body is not JSON
/// or nothing changed, leaving the original bytes in place.
pub fn apply_body_transform(rules: &CompiledBodyTransform, body: &[u8]) -> Option<Bytes> {
    let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object_mut()?;

    let mut changed = false;
    for field in &rules.remove {
        if object.remove(field).is_some() {
            changed = true;
        }
    }
    for (field, new_value) in &rules.add {
        object.insert(field.clone(), new_value.clone());
        changed = true;
    }
    if !changed {
        return None;
    }
    serde_json::to_vec(&value).ok().map(Bytes::from)
}

pub fn apply(
    spec: &Arc<ApiSpec>,
    parts: &RequestParts,
    ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let stripped = spec.strip_path(&parts.path).to_string();

    // URL rewrite over the stripped path
    let outbound_path = match spec.rewrite_path(&stripped, &parts.method) {
        Some(rewritten) => {
            trace!(
                trace_id = %ctx.trace_id,
                from = %stripped,
                to = %rewritten,
                "URL rewritten"
            );
            rewritten
        }
        None => stripped,
    };
    ctx.outbound_path = Some(outbound_path.clone());

    // Method transform
    for mt in &spec.def.method_transforms {
        if mt.method.eq_ignore_ascii_case(&parts.method)
            && outbound_path.starts_with(&mt.path)
        {
            ctx.outbound_method = Some(mt.to_method.to_uppercase());
            break;
        }
    }

    // Body transform plans; the proxy applies them while the bodies stream
    ctx.request_body_transform = spec.body_transform_for(&outbound_path, &parts.method);
    ctx.response_body_transform =
        spec.response_body_transform_for(&outbound_path, &parts.method);

    // Header injection plans
    let request = &spec.def.transform_headers.request;
    for (name, value) in &request.add {
        ctx.request_header_add.push((name.clone(), value.clone()));
    }
    for name in &request.remove {
        ctx.request_header_remove.push(name.clone());
    }

    let response = &spec.def.transform_headers.response;
    for (name, value) in &response.add {
        ctx.response_header_add.push((name.clone(), value.clone()));
    }
    for name in &response.remove {
        ctx.response_header_remove.push(name.clone());
    }

    Ok(StageDecision::Continue)
}
