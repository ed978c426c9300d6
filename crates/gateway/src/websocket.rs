//! WebSocket upgrade handling.
//!
//! The gateway bridges WebSocket (and SSE) connections transparently when
//! enabled at the server level: upgrades pass through the proxy and the
//! upstream connection is torn down as soon as the client goes away. This
//! module holds the upgrade detection used by the proxy lifecycle.

use http::HeaderMap;

/// Whether a request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade && connection_upgrade
}

/// Whether a request asks for a Server-Sent-Events stream.
pub fn is_sse_request(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn detects_upgrade() {
        assert!(is_websocket_upgrade(&headers(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
        ])));
        assert!(is_websocket_upgrade(&headers(&[
            ("Upgrade", "WebSocket"),
            ("Connection", "keep-alive, Upgrade"),
        ])));
    }

    #[test]
    fn plain_requests_are_not_upgrades() {
        assert!(!is_websocket_upgrade(&headers(&[])));
        assert!(!is_websocket_upgrade(&headers(&[("Upgrade", "websocket")])));
        assert!(!is_websocket_upgrade(&headers(&[(
            "Connection",
            "Upgrade"
        )])));
    }

    #[test]
    fn detects_sse() {
        assert!(is_sse_request(&headers(&[(
            "Accept",
            "text/event-stream"
        )])));
        assert!(!is_sse_request(&headers(&[("Accept", "application/json")])));
    }
}
