//! Shared fixtures for integration tests.

use std::sync::{Arc, OnceLock};

use gantry_common::RequestMetrics;
use gantry_config::{ApiDefinition, GatewayConfig, SessionState};
use gantry_gateway::cache::ResponseCache;
use gantry_gateway::events::Notifier;
use gantry_gateway::limits::{QuotaManager, RateLimiter};
use gantry_gateway::pipeline::{DriverRegistry, PipelineDeps, RequestParts};
use gantry_gateway::registry::{ApiSpec, PolicyRegistry};
use gantry_gateway::storage::{CertificateStore, KeyValueStore, MemoryStore, SessionStore};

/// Process-wide metrics handle; Prometheus refuses duplicate registration.
fn shared_metrics() -> Arc<RequestMetrics> {
    static METRICS: OnceLock<Arc<RequestMetrics>> = OnceLock::new();
    METRICS
        .get_or_init(|| Arc::new(RequestMetrics::new().expect("metrics registration")))
        .clone()
}

/// Pipeline dependencies over an in-memory store.
pub fn test_deps() -> PipelineDeps {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let config = Arc::new(GatewayConfig::default());
    PipelineDeps {
        sessions: Arc::new(SessionStore::new(Arc::clone(&store), true)),
        certs: Arc::new(CertificateStore::new()),
        policies: Arc::new(PolicyRegistry::new()),
        rate_limiter: Arc::new(RateLimiter::new(Arc::clone(&store), &config.rate_limit)),
        quotas: Arc::new(QuotaManager::new(
            Arc::clone(&store),
            config.quota_trigger_thresholds.clone(),
        )),
        cache: Arc::new(ResponseCache::new()),
        drivers: Arc::new(DriverRegistry::new()),
        notifier: Arc::new(Notifier::new()),
        metrics: shared_metrics(),
        config,
        store,
    }
}

/// Compile a definition from JSON.
pub fn spec(raw: &str) -> Arc<ApiSpec> {
    let def: ApiDefinition = serde_json::from_str(raw).expect("definition must parse");
    Arc::new(ApiSpec::build(def).expect("definition must compile"))
}

/// Request view with the given headers.
pub fn request(method: &str, path_and_query: &str, headers: &[(&str, &str)]) -> RequestParts {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (path_and_query.to_string(), None),
    };
    let mut header_map = http::HeaderMap::new();
    for (name, value) in headers {
        header_map.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            http::header::HeaderValue::from_str(value).unwrap(),
        );
    }
    RequestParts {
        method: method.to_string(),
        path,
        query,
        headers: header_map,
        client_ip: "127.0.0.1:52000".to_string(),
        client_cert_fingerprint: None,
        body: None,
    }
}

/// Store a session under a raw key.
pub async fn seed_session(deps: &PipelineDeps, key: &str, session: &SessionState) {
    deps.sessions.put(key, session).await.unwrap();
}
