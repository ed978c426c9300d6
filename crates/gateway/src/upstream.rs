//! Upstream dispatch helpers: target selection, URL joining, enforced
//! timeouts and peer construction.

use pingora::upstreams::peer::HttpPeer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gantry_common::{GatewayError, GatewayResult};

use crate::registry::ApiSpec;

/// Fixed body returned when the enforced timeout expires.
pub const HARD_TIMEOUT_BODY: &str = "Upstream service reached hard timeout";

/// Join two URL path segments with exactly one slash between them.
///
/// With `keep_trailing` false (the default), lone slashes collapse away;
/// with it true a bare `/` on the left survives. Either way the result
/// never contains doubled slashes at the seam.
pub fn single_joining_slash(a: &str, b: &str, keep_trailing: bool) -> String {
    if !keep_trailing {
        let a = a.trim_end_matches('/');
        let b = b.trim_start_matches('/');
        return match (a.is_empty(), b.is_empty()) {
            (true, true) => String::new(),
            (true, false) => b.to_string(),
            (false, true) => a.to_string(),
            (false, false) => format!("{}/{}", a, b),
        };
    }

    let b_trimmed = b.trim_start_matches('/');
    if b_trimmed.is_empty() {
        return a.to_string();
    }
    if a.ends_with('/') {
        format!("{}{}", a, b_trimmed)
    } else if a.is_empty() {
        b_trimmed.to_string()
    } else {
        format!("{}/{}", a, b_trimmed)
    }
}

/// A parsed upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme_https: bool,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl Target {
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let uri: http::Uri = raw
            .parse()
            .map_err(|_| GatewayError::config(format!("target URL '{}' does not parse", raw)))?;
        let scheme_https = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .ok_or_else(|| GatewayError::config(format!("target URL '{}' has no host", raw)))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme_https { 443 } else { 80 });
        let base_path = uri.path().to_string();
        Ok(Self {
            scheme_https,
            host,
            port,
            base_path,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Round-robin selection over an API's targets. The cursor lives inside
/// the owning snapshot, so selection state resets on reload along with the
/// rest of the per-API runtime state.
pub struct TargetSelector {
    targets: Vec<Target>,
    cursor: AtomicUsize,
}

impl TargetSelector {
    pub fn new(urls: &[String]) -> GatewayResult<Self> {
        let targets = urls
            .iter()
            .map(|t| Target::parse(t))
            .collect::<GatewayResult<Vec<_>>>()?;
        if targets.is_empty() {
            return Err(GatewayError::config("no upstream targets configured"));
        }
        Ok(Self {
            targets,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> &Target {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        &self.targets[idx]
    }
}

/// Effective deadline: the smaller of any matched per-path hard timeout and
/// the global default.
pub fn effective_timeout(
    spec: &ApiSpec,
    path: &str,
    method: &str,
    default_timeout: Duration,
) -> (Duration, bool) {
    match spec.hard_timeout_for(path, method) {
        Some(per_path) => {
            if per_path <= default_timeout {
                (per_path, true)
            } else {
                (default_timeout, false)
            }
        }
        None => (default_timeout, false),
    }
}

/// Build the Pingora peer for a target, applying the API's TLS constraints
/// and the effective timeout.
pub fn build_peer(spec: &ApiSpec, target: &Target, timeout: Duration) -> HttpPeer {
    let sni = spec
        .def
        .upstream_tls
        .sni
        .clone()
        .unwrap_or_else(|| target.host.clone());
    let mut peer = HttpPeer::new(target.address(), target.scheme_https, sni);
    peer.options.connection_timeout = Some(timeout.min(Duration::from_secs(10)));
    peer.options.read_timeout = Some(timeout);
    peer.options.write_timeout = Some(timeout);
    if spec.def.upstream_tls.insecure_skip_verify {
        peer.options.verify_cert = false;
    }
    peer
}

#[cfg(test)]
mod tests {
    use super::*;

    // The full joining table, both trailing-slash modes
    #[test]
    fn joining_slash_collapse_mode() {
        let cases = [
            ("", "", ""),
            ("/", "", ""),
            ("", "/", ""),
            ("/", "/", ""),
            ("foo", "", "foo"),
            ("foo", "/", "foo"),
            ("foo", "bar", "foo/bar"),
            ("foo/", "bar", "foo/bar"),
            ("foo", "/bar", "foo/bar"),
            ("foo/", "/bar", "foo/bar"),
            ("foo//", "//bar", "foo/bar"),
            ("foo", "bar/", "foo/bar/"),
            ("foo/", "bar/", "foo/bar/"),
            ("foo", "/bar/", "foo/bar/"),
            ("foo/", "/bar/", "foo/bar/"),
            ("foo//", "//bar/", "foo/bar/"),
        ];
        for (a, b, want) in cases {
            assert_eq!(single_joining_slash(a, b, false), want, "a={:?} b={:?}", a, b);
        }
    }

    #[test]
    fn joining_slash_keep_mode() {
        let cases = [
            ("", "", ""),
            ("/", "", "/"),
            ("", "/", ""),
            ("/", "/", "/"),
            ("foo", "", "foo"),
            ("foo", "/", "foo"),
            ("foo/", "", "foo/"),
            ("foo/", "/", "foo/"),
            ("foo/", "/name", "foo/name"),
            ("foo/", "/name/", "foo/name/"),
            ("foo/", "//name", "foo/name"),
            ("foo/", "//name/", "foo/name/"),
        ];
        for (a, b, want) in cases {
            assert_eq!(single_joining_slash(a, b, true), want, "a={:?} b={:?}", a, b);
        }
    }

    #[test]
    fn join_is_idempotent_under_empty() {
        let joined = single_joining_slash("/v1", "/items", false);
        assert_eq!(single_joining_slash(&joined, "", false), joined);
    }

    #[test]
    fn target_parse_defaults_ports() {
        let t = Target::parse("http://upstream/v1").unwrap();
        assert_eq!(t.port, 80);
        assert!(!t.scheme_https);
        assert_eq!(t.base_path, "/v1");

        let t = Target::parse("https://upstream:8443").unwrap();
        assert_eq!(t.port, 8443);
        assert!(t.scheme_https);
        assert_eq!(t.address(), "upstream:8443");
    }

    #[test]
    fn selector_round_robins() {
        let selector = TargetSelector::new(&[
            "http://a:1/".to_string(),
            "http://b:2/".to_string(),
        ])
        .unwrap();

        assert_eq!(selector.next().host, "a");
        assert_eq!(selector.next().host, "b");
        assert_eq!(selector.next().host, "a");
    }

    #[test]
    fn effective_timeout_takes_minimum() {
        let def: gantry_config::ApiDefinition = serde_json::from_str(
            r#"{"api_id":"t","name":"t","listen_path":"/t/",
                "target_urls":["http://u/"],
                "hard_timeouts":[
                    {"path":"^/slow","timeout":1},
                    {"path":"^/patient","timeout":60}
                ]}"#,
        )
        .unwrap();
        let spec = ApiSpec::build(def).unwrap();
        let default = Duration::from_secs(2);

        // Per-path timeout below the default wins
        assert_eq!(
            effective_timeout(&spec, "/slow/x", "GET", default),
            (Duration::from_secs(1), true)
        );
        // Per-path timeout above the default is capped by it
        assert_eq!(
            effective_timeout(&spec, "/patient/x", "GET", default),
            (Duration::from_secs(2), false)
        );
        // No per-path timeout: default applies
        assert_eq!(
            effective_timeout(&spec, "/other", "GET", default),
            (Duration::from_secs(2), false)
        );
    }
}
