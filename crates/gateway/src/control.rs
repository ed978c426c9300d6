//! Control-plane builtin endpoints.
//!
//! The engine answers a small set of endpoints in-process, under `/tyk/`
//! on the control port (or the primary port when no control port is set),
//! guarded by a shared secret in `X-Tyk-Authorization` compared in
//! constant time:
//!
//! - `GET  /tyk/hello`: liveness
//! - `GET  /tyk/health`: store reachability and last reload status
//! - `POST /tyk/reload`: enqueue a reload; `?block=true` waits for it

use bytes::Bytes;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use gantry_config::GatewayConfig;

use crate::pipeline::TerminalResponse;
use crate::reload::{ReloadQueue, ReloadStatus};
use crate::storage::KeyValueStore;

pub const CONTROL_PREFIX: &str = "/tyk/";
pub const AUTH_HEADER: &str = "x-tyk-authorization";

/// Everything the control endpoints need.
pub struct ControlState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub reload_queue: ReloadQueue,
    pub last_reload: Arc<dyn Fn() -> ReloadStatus + Send + Sync>,
}

/// Whether this request targets the control surface.
pub fn is_control_request(config: &GatewayConfig, port: u16, path: &str) -> bool {
    if !path.starts_with(CONTROL_PREFIX) {
        return false;
    }
    match config.control_api_port {
        Some(control_port) => port == control_port,
        None => port == config.listen_port,
    }
}

fn authorized(state: &ControlState, presented: Option<&str>) -> bool {
    let secret = state.config.secret.as_bytes();
    if secret.is_empty() {
        return false;
    }
    let presented = presented.unwrap_or("").as_bytes();
    presented.ct_eq(secret).unwrap_u8() == 1
}

fn json_response(status: u16, body: serde_json::Value) -> TerminalResponse {
    TerminalResponse {
        status,
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body: Bytes::from(body.to_string()),
    }
}

/// Serve a control request. Unknown control paths get 404.
pub async fn handle(
    state: &ControlState,
    method: &str,
    path: &str,
    query: Option<&str>,
    auth_header: Option<&str>,
) -> TerminalResponse {
    if !authorized(state, auth_header) {
        warn!(path = %path, "Control request with a bad or missing secret");
        return json_response(
            403,
            serde_json::json!({ "status": "error", "message": "Attempted administrative access with invalid or missing key!" }),
        );
    }

    match (method, path) {
        ("GET", "/tyk/hello") => json_response(
            200,
            serde_json::json!({ "status": "pass", "description": "Gantry gateway" }),
        ),
        ("GET", "/tyk/health") => {
            let store_ok = state.store.ping().await.is_ok();
            let reload = match (state.last_reload)() {
                ReloadStatus::Never => "never",
                ReloadStatus::Succeeded => "ok",
                ReloadStatus::Failed => "failed",
            };
            let healthy = store_ok && reload != "failed";
            json_response(
                if healthy { 200 } else { 503 },
                serde_json::json!({
                    "status": if healthy { "pass" } else { "fail" },
                    "store": if store_ok { "reachable" } else { "unreachable" },
                    "last_reload": reload,
                }),
            )
        }
        ("POST", "/tyk/reload") => {
            info!("Reload requested through the control API");
            let block = query
                .map(|q| q.split('&').any(|p| p == "block=true"))
                .unwrap_or(false);
            if block {
                let (tx, rx) = tokio::sync::oneshot::channel();
                state.reload_queue.queue(Some(Box::new(move || {
                    let _ = tx.send(());
                })));
                let _ = rx.await;
            } else {
                state.reload_queue.queue(None);
            }
            json_response(
                200,
                serde_json::json!({ "status": "ok", "message": "reload queued" }),
            )
        }
        _ => json_response(
            404,
            serde_json::json!({ "status": "error", "message": "not found" }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::{ReloadCoordinator, ReloadStatus};
    use crate::storage::MemoryStore;

    fn state_with_secret(secret: &str) -> ControlState {
        let config = Arc::new(GatewayConfig {
            secret: secret.to_string(),
            ..Default::default()
        });

        // A throwaway coordinator provides a working queue handle
        let coordinator = Arc::new(ReloadCoordinator::new(
            Arc::new(crate::loader::DirectoryApiSource::new("/nonexistent")),
            Arc::new(crate::loader::NoPolicySource),
            Arc::new(crate::registry::ApiRegistry::new()),
            Arc::new(crate::registry::PolicyRegistry::new()),
            Arc::new(crate::mux::ProxyMux::new(8080)),
            Arc::new(crate::events::Notifier::new()),
            Arc::clone(&config),
        ));

        ControlState {
            config,
            store: Arc::new(MemoryStore::new()),
            reload_queue: coordinator.queue_handle(),
            last_reload: Arc::new(|| ReloadStatus::Succeeded),
        }
    }

    #[test]
    fn control_request_detection() {
        let config = GatewayConfig {
            control_api_port: Some(9696),
            ..Default::default()
        };
        assert!(is_control_request(&config, 9696, "/tyk/hello"));
        assert!(!is_control_request(&config, 8080, "/tyk/hello"));
        assert!(!is_control_request(&config, 9696, "/other"));

        let config = GatewayConfig::default();
        assert!(is_control_request(&config, 8080, "/tyk/reload"));
    }

    #[tokio::test]
    async fn missing_secret_is_403() {
        let state = state_with_secret("s3cret");
        let response = handle(&state, "GET", "/tyk/hello", None, None).await;
        assert_eq!(response.status, 403);

        let response = handle(&state, "GET", "/tyk/hello", None, Some("wrong")).await;
        assert_eq!(response.status, 403);
    }

    #[tokio::test]
    async fn hello_and_health_respond() {
        let state = state_with_secret("s3cret");

        let response = handle(&state, "GET", "/tyk/hello", None, Some("s3cret")).await;
        assert_eq!(response.status, 200);

        let response = handle(&state, "GET", "/tyk/health", None, Some("s3cret")).await;
        assert_eq!(response.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["store"], "reachable");
        assert_eq!(body["last_reload"], "ok");
    }

    #[tokio::test]
    async fn empty_configured_secret_refuses_everything() {
        let state = state_with_secret("");
        let response = handle(&state, "GET", "/tyk/hello", None, Some("")).await;
        assert_eq!(response.status, 403);
    }

    #[tokio::test]
    async fn reload_enqueues() {
        let state = state_with_secret("s3cret");
        let response = handle(&state, "POST", "/tyk/reload", None, Some("s3cret")).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn unknown_control_path_is_404() {
        let state = state_with_secret("s3cret");
        let response = handle(&state, "GET", "/tyk/unknown", None, Some("s3cret")).await;
        assert_eq!(response.status, 404);
    }
}
