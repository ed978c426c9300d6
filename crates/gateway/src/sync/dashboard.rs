//! Config-service client.
//!
//! Speaks the nonce-carrying protocol of the remote config service: every
//! response carries a `Nonce` the next request must echo. The node
//! registers once, heartbeats every two seconds, re-registers on 403, and
//! de-registers at shutdown. Definition and policy pulls ride the same
//! client.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gantry_common::{generate_instance_id, GatewayError, GatewayResult};
use gantry_config::{ApiDefinition, GatewayConfig, Policy};

use crate::loader::{ApiProvider, PolicyProvider};

const HEADER_NONCE: &str = "x-tyk-nonce";
const HEADER_NODE_ID: &str = "x-tyk-nodeid";
const HEADER_SESSION_ID: &str = "x-tyk-sessionid";
const HEADER_HOSTNAME: &str = "x-tyk-hostname";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const REGISTER_RETRY: Duration = Duration::from_secs(5);

/// Envelope every config-service reply uses.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "Message")]
    message: T,
    #[serde(rename = "Nonce")]
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    #[serde(rename = "Status", default)]
    #[allow(dead_code)]
    status: String,
    #[serde(rename = "Message", default)]
    message: HashMap<String, String>,
    #[serde(rename = "Nonce", default)]
    nonce: String,
}

/// Quota trigger event shipped to the config service.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaTriggerEvent {
    pub event: String,
    pub key_hash: String,
    pub api_id: String,
    pub org_id: String,
    pub remaining: i64,
    pub threshold: f64,
}

/// Client for the remote config service.
pub struct DashboardClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
    session_id: String,
    hostname: String,
    node_id: RwLock<String>,
    nonce: RwLock<String>,
}

impl DashboardClient {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let base_url = config
            .db_app_conf_options
            .connection_string
            .clone()
            .ok_or_else(|| GatewayError::config("remote config source has no connection string"))?;
        let timeout = Duration::from_secs(config.db_app_conf_options.connection_timeout.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Sync {
                message: "Failed to build HTTP client".to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: config.node_secret.clone(),
            session_id: generate_instance_id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "gantry".to_string()),
            node_id: RwLock::new(String::new()),
            nonce: RwLock::new(String::new()),
        })
    }

    pub fn node_id(&self) -> String {
        self.node_id.read().clone()
    }

    fn set_nonce(&self, nonce: String) {
        *self.nonce.write() = nonce;
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .request(method, url)
            .header("authorization", &self.secret)
            .header(HEADER_NODE_ID, self.node_id.read().as_str())
            .header(HEADER_NONCE, self.nonce.read().as_str())
            .header(HEADER_SESSION_ID, &self.session_id)
            .header(HEADER_HOSTNAME, &self.hostname)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> GatewayResult<reqwest::Response> {
        builder.send().await.map_err(|e| GatewayError::Sync {
            message: format!("config service request failed: {}", e),
            source: Some(Box::new(e)),
        })
    }

    /// Register this node. A 409 means the node is already registered.
    pub async fn register(&self) -> GatewayResult<()> {
        info!("Registering gateway node with the config service");
        let response = self
            .send(self.request(reqwest::Method::GET, "/register/node"))
            .await?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            debug!("Node is already registered");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(GatewayError::sync(format!(
                "node registration failed with status {}",
                response.status()
            )));
        }

        let body: NodeResponse = response.json().await.map_err(|e| GatewayError::Sync {
            message: "unreadable registration response".to_string(),
            source: Some(Box::new(e)),
        })?;

        let node_id = body.message.get("NodeID").cloned().ok_or_else(|| {
            GatewayError::sync("registration response carries no NodeID")
        })?;
        *self.node_id.write() = node_id;
        self.set_nonce(body.nonce);

        info!(node_id = %self.node_id(), "Node registered");
        Ok(())
    }

    /// Register with retries until `shutdown` flips.
    pub async fn register_with_retry(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            match self.register().await {
                Ok(()) => return,
                Err(e) => {
                    error!(error = %e, "Node registration failed, retrying in 5s");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(REGISTER_RETRY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn ping_once(&self) -> GatewayResult<bool> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/register/ping"))
            .await?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            // Nonce desync or eviction: a full re-register is required
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(GatewayError::sync(format!(
                "heartbeat failed with status {}",
                response.status()
            )));
        }
        let body: NodeResponse = response.json().await.map_err(|e| GatewayError::Sync {
            message: "unreadable heartbeat response".to_string(),
            source: Some(Box::new(e)),
        })?;
        self.set_nonce(body.nonce);
        Ok(true)
    }

    /// Heartbeat loop: ping every two seconds, re-register on 403, back
    /// off and retry on transport errors. Runs until `shutdown` flips.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                _ = shutdown.changed() => {
                    info!("Heartbeat stopped");
                    return;
                }
            }
            match self.ping_once().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Heartbeat got 403, re-registering node");
                    self.register_with_retry(&mut shutdown).await;
                }
                Err(e) => {
                    warn!(error = %e, "Heartbeat failed, backing off");
                }
            }
        }
    }

    /// De-register at shutdown.
    pub async fn deregister(&self) -> GatewayResult<()> {
        let response = self
            .send(self.request(reqwest::Method::DELETE, "/system/node"))
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::sync(format!(
                "deregistration failed with status {}",
                response.status()
            )));
        }
        if let Ok(body) = response.json::<NodeResponse>().await {
            self.set_nonce(body.nonce);
        }
        info!("Node de-registered");
        Ok(())
    }

    /// Ship a quota trigger event.
    pub async fn notify_quota_trigger(&self, event: &QuotaTriggerEvent) -> GatewayResult<()> {
        let response = self
            .send(
                self.request(reqwest::Method::POST, "/system/key/quota_trigger")
                    .json(event),
            )
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::sync(format!(
                "quota trigger notification failed with status {}",
                response.status()
            )));
        }
        if let Ok(body) = response.json::<NodeResponse>().await {
            self.set_nonce(body.nonce);
        }
        Ok(())
    }
}

#[async_trait]
impl ApiProvider for DashboardClient {
    async fn fetch_apis(&self) -> GatewayResult<Vec<ApiDefinition>> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/system/apis"))
            .await?;
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::sync("definition pull forbidden, node must re-register"));
        }
        if !response.status().is_success() {
            return Err(GatewayError::sync(format!(
                "definition pull failed with status {}",
                response.status()
            )));
        }
        let envelope: Envelope<Vec<ApiDefinition>> =
            response.json().await.map_err(|e| GatewayError::Sync {
                message: "unreadable definition payload".to_string(),
                source: Some(Box::new(e)),
            })?;
        self.set_nonce(envelope.nonce);
        debug!(count = envelope.message.len(), "Pulled API definitions");
        Ok(envelope.message)
    }

    fn source_id(&self) -> String {
        format!("{}/system/apis", self.base_url)
    }
}

#[async_trait]
impl PolicyProvider for DashboardClient {
    async fn fetch_policies(&self) -> GatewayResult<HashMap<String, Policy>> {
        let response = self
            .send(self.request(reqwest::Method::GET, "/system/policies"))
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::sync(format!(
                "policy pull failed with status {}",
                response.status()
            )));
        }
        let envelope: Envelope<Vec<Policy>> =
            response.json().await.map_err(|e| GatewayError::Sync {
                message: "unreadable policy payload".to_string(),
                source: Some(Box::new(e)),
            })?;
        self.set_nonce(envelope.nonce);

        let mut policies = HashMap::with_capacity(envelope.message.len());
        for policy in envelope.message {
            let id = policy.id.clone();
            if id.is_empty() {
                warn!("Skipping policy without an id");
                continue;
            }
            if policies.contains_key(&id) {
                warn!(policy_id = %id, "Skipping policy, new item has a duplicate id");
                continue;
            }
            policies.insert(id, policy);
        }
        Ok(policies)
    }

    fn source_id(&self) -> String {
        format!("{}/system/policies", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Tiny canned-response HTTP server; records the nonce header of each
    /// request it saw.
    async fn canned_server(
        responses: Vec<String>,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            for body in responses {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 8192];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();

                let nonce = request
                    .lines()
                    .find_map(|line| line.to_ascii_lowercase().strip_prefix("x-tyk-nonce:").map(|v| v.trim().to_string()))
                    .unwrap_or_default();
                let _ = tx.send(nonce);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(response.as_bytes()).await;
            }
        });

        (addr, rx)
    }

    fn client_for(addr: SocketAddr) -> DashboardClient {
        let mut config = GatewayConfig::default();
        config.node_secret = "node-secret".to_string();
        config.db_app_conf_options.enabled = true;
        config.db_app_conf_options.connection_string = Some(format!("http://{}", addr));
        DashboardClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn nonce_is_echoed_on_subsequent_calls() {
        let apis_body = |nonce: &str| {
            format!(
                r#"{{"Message":[{{"api_id":"a","name":"a","listen_path":"/a/",
                    "target_urls":["http://u/"]}}],"Nonce":"{}"}}"#,
                nonce
            )
        };
        let (addr, mut seen) =
            canned_server(vec![apis_body("nonce-1"), apis_body("nonce-2")]).await;
        let client = client_for(addr);

        let first = client.fetch_apis().await.unwrap();
        assert_eq!(first.len(), 1);
        // First call carries an empty nonce
        assert_eq!(seen.recv().await.unwrap(), "");

        let _ = client.fetch_apis().await.unwrap();
        // Second call echoes the nonce from the first reply
        assert_eq!(seen.recv().await.unwrap(), "nonce-1");
    }

    #[tokio::test]
    async fn register_sets_node_id_and_nonce() {
        let body = r#"{"Status":"ok","Message":{"NodeID":"node-42"},"Nonce":"reg-nonce"}"#;
        let (addr, _seen) = canned_server(vec![body.to_string()]).await;
        let client = client_for(addr);

        client.register().await.unwrap();
        assert_eq!(client.node_id(), "node-42");
    }

    #[tokio::test]
    async fn duplicate_policies_are_skipped() {
        let body = r#"{"Message":[
            {"id":"p1","rate":1.0,"per":60.0},
            {"id":"p1","rate":99.0,"per":60.0},
            {"id":"p2","rate":2.0,"per":60.0}
        ],"Nonce":"n"}"#;
        let (addr, _seen) = canned_server(vec![body.to_string()]).await;
        let client = client_for(addr);

        let policies = client.fetch_policies().await.unwrap();
        assert_eq!(policies.len(), 2);
        // The first occurrence wins
        assert_eq!(policies["p1"].rate, 1.0);
    }
}
