//! Proxy mux: maps (port, host, path) to a published API.
//!
//! The mux owns a table keyed by listen port. Each HTTP entry carries a
//! host router (exact hosts, wildcard hosts, hostless fallback) whose leaves
//! are listen-path tables matched longest-prefix-first. The whole table is
//! swapped atomically on install; a request in flight keeps the table it
//! started with. TCP/TLS passthrough entries own a per-port forwarder task
//! that install starts and stops as ports appear and disappear.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use gantry_config::{GatewayConfig, ListenProtocol};

use crate::registry::{ApiSnapshot, ApiSpec};
use crate::tcp::TcpProxyHandle;

/// Listen paths for one (port, host) scope, longest first.
#[derive(Default)]
struct PathTable {
    entries: Vec<(String, Arc<ApiSpec>)>,
}

impl PathTable {
    fn insert(&mut self, spec: Arc<ApiSpec>) -> bool {
        let listen = normalize_listen_path(&spec.def.listen_path);
        if self.entries.iter().any(|(existing, _)| *existing == listen) {
            return false;
        }
        self.entries.push((listen, spec));
        self.entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        true
    }

    fn matches(&self, path: &str) -> Option<Arc<ApiSpec>> {
        for (listen, spec) in &self.entries {
            if listen == "/" {
                return Some(Arc::clone(spec));
            }
            if path == listen || path.starts_with(&format!("{}/", listen)) {
                return Some(Arc::clone(spec));
            }
        }
        None
    }
}

fn normalize_listen_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Routes for one HTTP port.
#[derive(Default)]
struct HostRouter {
    exact: HashMap<String, PathTable>,
    wildcard: Vec<(String, PathTable)>,
    any: PathTable,
}

impl HostRouter {
    fn table_for(&mut self, domain: &Option<String>) -> &mut PathTable {
        match domain {
            Some(host) if host.starts_with("*.") => {
                let suffix = host[1..].to_string(); // keep the leading dot
                let pos = match self.wildcard.iter().position(|(s, _)| *s == suffix) {
                    Some(pos) => pos,
                    None => {
                        self.wildcard.push((suffix, PathTable::default()));
                        self.wildcard.len() - 1
                    }
                };
                &mut self.wildcard[pos].1
            }
            Some(host) if !host.is_empty() => {
                self.exact.entry(host.clone()).or_default()
            }
            _ => &mut self.any,
        }
    }

    fn matches(&self, host: &str, path: &str) -> Option<Arc<ApiSpec>> {
        let host = host.split(':').next().unwrap_or(host);
        if let Some(table) = self.exact.get(host) {
            if let Some(spec) = table.matches(path) {
                return Some(spec);
            }
        }
        for (suffix, table) in &self.wildcard {
            if host.ends_with(suffix.as_str()) && host.len() > suffix.len() {
                if let Some(spec) = table.matches(path) {
                    return Some(spec);
                }
            }
        }
        self.any.matches(path)
    }
}

enum PortService {
    Http(HostRouter),
    Tcp(Vec<Arc<ApiSpec>>),
}

type PortTable = HashMap<u16, PortService>;

/// The mux. `match_request` is a lock-free snapshot read.
pub struct ProxyMux {
    table: ArcSwap<PortTable>,
    default_port: u16,
    tcp_proxies: Mutex<HashMap<u16, TcpProxyHandle>>,
}

impl ProxyMux {
    pub fn new(default_port: u16) -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
            default_port,
            tcp_proxies: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a request to an API. `port` is the local port the request
    /// arrived on; unknown ports fall back to the primary port's routes.
    pub fn match_request(
        &self,
        port: u16,
        host: &str,
        path: &str,
    ) -> Option<Arc<ApiSpec>> {
        let table = self.table.load();
        let service = table
            .get(&port)
            .or_else(|| table.get(&self.default_port))?;
        match service {
            PortService::Http(router) => router.matches(host, path),
            PortService::Tcp(_) => None,
        }
    }

    /// Build a fresh table from the snapshot and swap it in. HTTP ports not
    /// in the whitelist are skipped; TCP entries get their forwarder task
    /// started, and forwarders whose port disappeared are stopped.
    pub async fn install(&self, snapshot: &ApiSnapshot, config: &GatewayConfig) {
        let mut table: PortTable = HashMap::new();
        let mut tcp_specs: HashMap<u16, Vec<Arc<ApiSpec>>> = HashMap::new();

        for spec in &snapshot.specs {
            if !spec.def.active {
                debug!(api_id = %spec.api_id(), "Skipping inactive API");
                continue;
            }
            let port = spec.def.effective_port(self.default_port);
            if !config.is_port_allowed(port) {
                warn!(
                    api_id = %spec.api_id(),
                    port = port,
                    "API claims a port outside the whitelist, skipping"
                );
                continue;
            }
            match spec.def.protocol {
                ListenProtocol::Http | ListenProtocol::Https => {
                    let entry = table
                        .entry(port)
                        .or_insert_with(|| PortService::Http(HostRouter::default()));
                    let PortService::Http(router) = entry else {
                        warn!(
                            api_id = %spec.api_id(),
                            port = port,
                            "Port already owned by a TCP API, skipping"
                        );
                        continue;
                    };
                    let inserted = router
                        .table_for(&spec.def.domain)
                        .insert(Arc::clone(spec));
                    if !inserted {
                        warn!(
                            api_id = %spec.api_id(),
                            listen_path = %spec.def.listen_path,
                            port = port,
                            "Duplicate listen path for (port, host), keeping the first"
                        );
                    }
                }
                ListenProtocol::Tcp | ListenProtocol::Tls => {
                    tcp_specs.entry(port).or_default().push(Arc::clone(spec));
                }
            }
        }

        for (port, specs) in &tcp_specs {
            table.insert(*port, PortService::Tcp(specs.clone()));
        }

        let http_ports = table
            .iter()
            .filter(|(_, s)| matches!(s, PortService::Http(_)))
            .count();
        info!(
            apis = snapshot.len(),
            http_ports = http_ports,
            tcp_ports = tcp_specs.len(),
            "Installing proxy mux table"
        );

        self.table.store(Arc::new(table));
        self.reconcile_tcp(tcp_specs).await;
    }

    /// Start forwarders for new TCP ports, stop removed ones. The listener
    /// for an unchanged port is reused.
    async fn reconcile_tcp(&self, desired: HashMap<u16, Vec<Arc<ApiSpec>>>) {
        let mut stopped = Vec::new();
        let mut started = Vec::new();
        {
            let mut running = self.tcp_proxies.lock();
            running.retain(|port, handle| {
                if desired.contains_key(port) {
                    true
                } else {
                    handle.shutdown();
                    stopped.push(*port);
                    false
                }
            });
            for (port, specs) in desired {
                if running.contains_key(&port) {
                    continue;
                }
                // First spec wins the port; validation already warned on clashes
                if let Some(spec) = specs.first() {
                    match TcpProxyHandle::spawn(port, Arc::clone(spec)) {
                        Ok(handle) => {
                            running.insert(port, handle);
                            started.push(port);
                        }
                        Err(e) => {
                            warn!(port = port, error = %e, "Failed to start TCP proxy");
                        }
                    }
                }
            }
        }
        for port in stopped {
            info!(port = port, "Stopped TCP proxy");
        }
        for port in started {
            info!(port = port, "Started TCP proxy");
        }
    }

    /// Stop accepting and drain: TCP forwarder contexts are cancelled
    /// immediately; the caller drains HTTP separately against `deadline`.
    pub async fn graceful_stop(&self, deadline: Duration) {
        let handles: Vec<TcpProxyHandle> = {
            let mut running = self.tcp_proxies.lock();
            running.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.shutdown();
        }
        for handle in handles {
            handle.wait(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ApiSpec;

    fn spec(api_id: &str, listen_path: &str) -> Arc<ApiSpec> {
        let def = serde_json::from_str(&format!(
            r#"{{"api_id":"{}","name":"{}","listen_path":"{}",
                "target_urls":["http://127.0.0.1:8000/"]}}"#,
            api_id, api_id, listen_path
        ))
        .unwrap();
        Arc::new(ApiSpec::build(def).unwrap())
    }

    fn spec_with(api_id: &str, listen_path: &str, patch: impl FnOnce(&mut gantry_config::ApiDefinition)) -> Arc<ApiSpec> {
        let mut def: gantry_config::ApiDefinition = serde_json::from_str(&format!(
            r#"{{"api_id":"{}","name":"{}","listen_path":"{}",
                "target_urls":["http://127.0.0.1:8000/"]}}"#,
            api_id, api_id, listen_path
        ))
        .unwrap();
        patch(&mut def);
        Arc::new(ApiSpec::build(def).unwrap())
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            port_whitelist: vec![9000],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn longest_listen_path_wins() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![
            spec("root", "/"),
            spec("api", "/api/"),
            spec("api-v2", "/api/v2/"),
        ]);
        mux.install(&snapshot, &config()).await;

        assert_eq!(
            mux.match_request(8080, "", "/api/v2/items").unwrap().api_id(),
            "api-v2"
        );
        assert_eq!(
            mux.match_request(8080, "", "/api/items").unwrap().api_id(),
            "api"
        );
        assert_eq!(
            mux.match_request(8080, "", "/other").unwrap().api_id(),
            "root"
        );
    }

    #[tokio::test]
    async fn prefix_match_respects_segment_boundary() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![spec("api", "/api/")]);
        mux.install(&snapshot, &config()).await;

        assert!(mux.match_request(8080, "", "/api/items").is_some());
        assert!(mux.match_request(8080, "", "/api").is_some());
        assert!(mux.match_request(8080, "", "/apifoo").is_none());
    }

    #[tokio::test]
    async fn host_routing_exact_and_wildcard() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![
            spec_with("tenant-a", "/", |d| d.domain = Some("a.example.com".into())),
            spec_with("tenant-any", "/", |d| d.domain = Some("*.example.com".into())),
            spec("fallback", "/"),
        ]);
        mux.install(&snapshot, &config()).await;

        assert_eq!(
            mux.match_request(8080, "a.example.com", "/x").unwrap().api_id(),
            "tenant-a"
        );
        assert_eq!(
            mux.match_request(8080, "b.example.com", "/x").unwrap().api_id(),
            "tenant-any"
        );
        assert_eq!(
            mux.match_request(8080, "other.io", "/x").unwrap().api_id(),
            "fallback"
        );
        // Host header port is ignored
        assert_eq!(
            mux.match_request(8080, "a.example.com:8080", "/x")
                .unwrap()
                .api_id(),
            "tenant-a"
        );
    }

    #[tokio::test]
    async fn ports_outside_whitelist_are_skipped() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![spec_with("rogue", "/", |d| {
            d.listen_port = Some(12345)
        })]);
        mux.install(&snapshot, &config()).await;

        assert!(mux.match_request(12345, "", "/").is_none());
        assert!(mux.match_request(8080, "", "/").is_none());
    }

    #[tokio::test]
    async fn extra_whitelisted_port_routes_separately() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![
            spec("main", "/"),
            spec_with("side", "/side/", |d| d.listen_port = Some(9000)),
        ]);
        mux.install(&snapshot, &config()).await;

        assert_eq!(
            mux.match_request(9000, "", "/side/x").unwrap().api_id(),
            "side"
        );
        // On the primary port the catch-all wins; the side API is not there
        assert_eq!(
            mux.match_request(8080, "", "/side/x").unwrap().api_id(),
            "main"
        );
    }

    #[tokio::test]
    async fn duplicate_listen_path_keeps_first() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![
            spec("first", "/same/"),
            spec("second", "/same/"),
        ]);
        mux.install(&snapshot, &config()).await;

        assert_eq!(
            mux.match_request(8080, "", "/same/x").unwrap().api_id(),
            "first"
        );
    }

    #[tokio::test]
    async fn install_swaps_whole_table() {
        let mux = ProxyMux::new(8080);
        mux.install(
            &ApiSnapshot::from_specs(vec![spec("old", "/old/")]),
            &config(),
        )
        .await;
        assert!(mux.match_request(8080, "", "/old/x").is_some());

        mux.install(
            &ApiSnapshot::from_specs(vec![spec("new", "/new/")]),
            &config(),
        )
        .await;
        assert!(mux.match_request(8080, "", "/old/x").is_none());
        assert!(mux.match_request(8080, "", "/new/x").is_some());
    }

    #[tokio::test]
    async fn inactive_apis_are_not_routed() {
        let mux = ProxyMux::new(8080);
        let snapshot = ApiSnapshot::from_specs(vec![spec_with("off", "/off/", |d| {
            d.active = false
        })]);
        mux.install(&snapshot, &config()).await;
        assert!(mux.match_request(8080, "", "/off/x").is_none());
    }
}
