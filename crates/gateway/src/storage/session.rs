//! Session persistence over the key/value store.
//!
//! Sessions are JSON-encoded under `apikey-<id>` keys, where `<id>` is the
//! SHA-256 hash of the presented key when key hashing is enabled. TTLs
//! follow the session's own expiry.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use gantry_common::GatewayResult;
use gantry_config::SessionState;

use super::KeyValueStore;

const SESSION_PREFIX: &str = "apikey-";

/// Hash a raw key for storage addressing.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Session store keyed by hashed or plain identifiers.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    hash_keys: bool,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, hash_keys: bool) -> Self {
        Self { store, hash_keys }
    }

    /// Storage address for a presented key.
    pub fn storage_id(&self, raw_key: &str) -> String {
        if self.hash_keys {
            hash_key(raw_key)
        } else {
            raw_key.to_string()
        }
    }

    fn storage_key(&self, raw_key: &str) -> String {
        format!("{}{}", SESSION_PREFIX, self.storage_id(raw_key))
    }

    /// Fetch the session for a presented key, if one exists.
    pub async fn get(&self, raw_key: &str) -> GatewayResult<Option<SessionState>> {
        let key = self.storage_key(raw_key);
        match self.store.get(&key).await? {
            Some(raw) => {
                let session: SessionState = serde_json::from_str(&raw)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Persist a session. TTL derives from the session expiry when set.
    pub async fn put(&self, raw_key: &str, session: &SessionState) -> GatewayResult<()> {
        let mut session = session.clone();
        session.last_updated = Utc::now().to_rfc3339();

        let ttl = if session.expires > 0 {
            let now = Utc::now().timestamp();
            let remaining = session.expires - now;
            if remaining <= 0 {
                debug!(key = %self.storage_id(raw_key), "Refusing to persist an expired session");
                return Ok(());
            }
            Some(Duration::from_secs(remaining as u64))
        } else {
            None
        };

        let raw = serde_json::to_string(&session)?;
        self.store.set(&self.storage_key(raw_key), &raw, ttl).await
    }

    pub async fn delete(&self, raw_key: &str) -> GatewayResult<bool> {
        self.store.delete(&self.storage_key(raw_key)).await
    }
}
