//! IP allow/deny checks.
//!
//! Entries are single addresses or CIDR prefixes. A deny match refuses the
//! request; when an allow list exists, anything off it is refused too.

use std::net::IpAddr;
use std::sync::Arc;

use gantry_common::{GatewayError, GatewayResult};

use crate::gateway::context::RequestContext;
use crate::registry::ApiSpec;

use super::{RequestParts, StageDecision};

/// Match an address against an entry: exact address or `addr/prefix`.
fn entry_matches(entry: &str, addr: IpAddr) -> bool {
    if let Some((base, prefix)) = entry.split_once('/') {
        let (Ok(base), Ok(prefix)) = (base.parse::<IpAddr>(), prefix.parse::<u32>()) else {
            return false;
        };
        return cidr_contains(base, prefix, addr);
    }
    entry.parse::<IpAddr>().map(|e| e == addr).unwrap_or(false)
}

fn cidr_contains(base: IpAddr, prefix: u32, addr: IpAddr) -> bool {
    match (base, addr) {
        (IpAddr::V4(base), IpAddr::V4(addr)) => {
            if prefix == 0 {
                return true;
            }
            if prefix > 32 {
                return false;
            }
            let mask = u32::MAX << (32 - prefix);
            (u32::from(base) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(base), IpAddr::V6(addr)) => {
            if prefix == 0 {
                return true;
            }
            if prefix > 128 {
                return false;
            }
            let mask = u128::MAX << (128 - prefix);
            (u128::from(base) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

pub fn apply(
    spec: &Arc<ApiSpec>,
    parts: &RequestParts,
    _ctx: &mut RequestContext,
) -> GatewayResult<StageDecision> {
    let access = &spec.def.ip_access;

    // The client address may carry a port
    let raw = parts
        .client_ip
        .rsplit_once(':')
        .map(|(host, _)| host)
        .filter(|host| host.contains('.') || host.contains('['))
        .unwrap_or(parts.client_ip.as_str())
        .trim_matches(|c| c == '[' || c == ']');
    let Ok(addr) = raw.parse::<IpAddr>() else {
        return Err(GatewayError::forbidden("access from this IP has been disallowed"));
    };

    if access.deny.iter().any(|e| entry_matches(e, addr)) {
        return Err(GatewayError::forbidden("access from this IP has been disallowed"));
    }
    if !access.allow.is_empty() && !access.allow.iter().any(|e| entry_matches(e, addr)) {
        return Err(GatewayError::forbidden("access from this IP has been disallowed"));
    }
    Ok(StageDecision::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{parts_with_ip, spec_from_json};

    fn spec(allow: &str, deny: &str) -> Arc<ApiSpec> {
        spec_from_json(&format!(
            r#"{{"api_id":"ip","name":"ip","listen_path":"/ip/",
                "target_urls":["http://u/"],
                "ip_access": {{ "allow": [{}], "deny": [{}] }} }}"#,
            allow, deny
        ))
    }

    #[test]
    fn allow_list_admits_and_refuses() {
        let spec = spec(r#""10.0.0.0/8""#, "");
        let mut ctx = RequestContext::new();

        let parts = parts_with_ip("GET", "/ip/x", "10.1.2.3:4444");
        assert!(apply(&spec, &parts, &mut ctx).is_ok());

        let parts = parts_with_ip("GET", "/ip/x", "192.168.1.1:4444");
        assert!(apply(&spec, &parts, &mut ctx).is_err());
    }

    #[test]
    fn deny_list_wins() {
        let spec = spec("", r#""10.0.0.5""#);
        let mut ctx = RequestContext::new();

        let parts = parts_with_ip("GET", "/ip/x", "10.0.0.5");
        assert!(apply(&spec, &parts, &mut ctx).is_err());

        let parts = parts_with_ip("GET", "/ip/x", "10.0.0.6");
        assert!(apply(&spec, &parts, &mut ctx).is_ok());
    }

    #[test]
    fn cidr_matching() {
        use std::net::Ipv4Addr;
        assert!(entry_matches(
            "10.0.0.0/24",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200))
        ));
        assert!(!entry_matches(
            "10.0.0.0/24",
            IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1))
        ));
        assert!(entry_matches(
            "0.0.0.0/0",
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
        ));
    }
}
