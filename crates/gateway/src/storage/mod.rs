//! Key/value store adapter.
//!
//! All shared state (sessions, rate counters, quotas, cluster
//! notifications) goes through the [`KeyValueStore`] trait. The production
//! implementation is Redis via a reconnecting [`ConnectionManager`]; tests
//! and single-node dev setups use the in-memory implementation.

pub mod certs;
pub mod session;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use gantry_config::StorageConfig;
use gantry_common::{GatewayError, GatewayResult};

pub use certs::CertificateStore;
pub use session::SessionStore;

/// Uniform interface over the backing store.
///
/// Counter mutations (`incr`) are atomic on the store side; the gateway
/// never holds a local lock across a store call.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()>;

    async fn delete(&self, key: &str) -> GatewayResult<bool>;

    /// Atomically increment a counter, returning the new value.
    async fn incr(&self, key: &str) -> GatewayResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()>;

    /// Remaining TTL, `None` when the key has no expiry or does not exist.
    async fn ttl(&self, key: &str) -> GatewayResult<Option<Duration>>;

    /// Sliding-window membership op: drop entries older than `window`, add
    /// `now_ms`, and return how many entries remain in the window.
    async fn window_count(
        &self,
        key: &str,
        now_ms: f64,
        window: Duration,
    ) -> GatewayResult<i64>;

    async fn publish(&self, channel: &str, message: &str) -> GatewayResult<()>;

    /// Subscribe to a channel. Messages are fanned out on the returned
    /// receiver; a lagging receiver drops the oldest messages.
    async fn subscribe(&self, channel: &str) -> GatewayResult<broadcast::Receiver<String>>;

    async fn ping(&self) -> GatewayResult<()>;
}

fn storage_err(e: redis::RedisError) -> GatewayError {
    GatewayError::Storage {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// Redis-backed store.
pub struct RedisStore {
    connection: ConnectionManager,
    client: redis::Client,
    timeout: Duration,
    healthy: AtomicBool,
}

impl RedisStore {
    pub async fn connect(config: &StorageConfig) -> GatewayResult<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(storage_err)?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(storage_err)?;

        debug!(url = %config.url, "Connected to Redis store");

        Ok(Self {
            connection,
            client,
            timeout: Duration::from_millis(config.timeout_ms),
            healthy: AtomicBool::new(true),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn run<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.healthy.store(true, Ordering::Relaxed);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(storage_err(e))
            }
            Err(_) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(GatewayError::storage("store operation timed out"))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.run(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        let mut conn = self.connection.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.run(async move {
            match ttl {
                Some(ttl) => {
                    conn.set_ex::<_, _, ()>(&key, &value, ttl.as_secs().max(1))
                        .await
                }
                None => conn.set::<_, _, ()>(&key, &value).await,
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        let mut conn = self.connection.clone();
        let key = key.to_string();
        self.run(async move { conn.del::<_, i64>(&key).await })
            .await
            .map(|n| n > 0)
    }

    async fn incr(&self, key: &str) -> GatewayResult<i64> {
        let mut conn = self.connection.clone();
        let key = key.to_string();
        self.run(async move { conn.incr::<_, _, i64>(&key, 1).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.connection.clone();
        let key = key.to_string();
        self.run(async move {
            conn.expire::<_, ()>(&key, ttl.as_secs().max(1) as i64).await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> GatewayResult<Option<Duration>> {
        let mut conn = self.connection.clone();
        let key = key.to_string();
        let secs = self
            .run(async move { conn.ttl::<_, i64>(&key).await })
            .await?;
        if secs < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(secs as u64)))
        }
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: f64,
        window: Duration,
    ) -> GatewayResult<i64> {
        let mut conn = self.connection.clone();
        let key = key.to_string();
        let window_start = now_ms - window.as_millis() as f64;
        let expiry = (window.as_secs() * 2).max(2) as i64;

        let (count,): (i64,) = self
            .run(async move {
                redis::pipe()
                    .atomic()
                    .zrembyscore(&key, 0.0, window_start)
                    .ignore()
                    .zadd(&key, now_ms.to_string(), now_ms)
                    .ignore()
                    .expire(&key, expiry)
                    .ignore()
                    .zcount(&key, window_start, now_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(count)
    }

    async fn publish(&self, channel: &str, message: &str) -> GatewayResult<()> {
        let mut conn = self.connection.clone();
        let channel = channel.to_string();
        let message = message.to_string();
        self.run(async move { conn.publish::<_, _, ()>(&channel, &message).await })
            .await
    }

    async fn subscribe(&self, channel: &str) -> GatewayResult<broadcast::Receiver<String>> {
        let (tx, rx) = broadcast::channel(64);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(storage_err)?;
        pubsub.subscribe(channel).await.map_err(storage_err)?;

        let channel = channel.to_string();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping unreadable pubsub message");
                    }
                }
            }
            error!(channel = %channel, "Store subscription ended");
        });

        Ok(rx)
    }

    async fn ping(&self) -> GatewayResult<()> {
        let mut conn = self.connection.clone();
        self.run(async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

/// In-process store used by tests and single-node dev setups.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    windows: DashMap<String, Vec<f64>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        match self.entries.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> GatewayResult<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: "0".to_string(),
            expires_at: None,
        });
        if !entry.live() {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let next = entry
            .value
            .parse::<i64>()
            .map_err(|_| GatewayError::storage("counter key holds a non-integer"))?
            + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> GatewayResult<Option<Duration>> {
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .map(|t| t.saturating_duration_since(Instant::now()))
        }))
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: f64,
        window: Duration,
    ) -> GatewayResult<i64> {
        let window_start = now_ms - window.as_millis() as f64;
        let mut entries = self.windows.entry(key.to_string()).or_default();
        entries.retain(|&t| t > window_start);
        entries.push(now_ms);
        Ok(entries.len() as i64)
    }

    async fn publish(&self, channel: &str, message: &str) -> GatewayResult<()> {
        // A send error just means nobody is listening
        let _ = self.channel(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> GatewayResult<broadcast::Receiver<String>> {
        Ok(self.channel(channel).subscribe())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Build the configured store.
pub async fn connect_store(config: &StorageConfig) -> GatewayResult<Arc<dyn KeyValueStore>> {
    match config.kind {
        gantry_config::StorageKind::Redis => {
            Ok(Arc::new(RedisStore::connect(config).await?))
        }
        gantry_config::StorageKind::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
