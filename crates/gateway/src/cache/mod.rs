//! Response cache.
//!
//! Maps a request fingerprint to a stored response with a TTL. Concurrent
//! misses for the same fingerprint are collapsed: the first request becomes
//! the fetch leader and the rest wait for it to publish (or abandon) before
//! re-checking, so one upstream fetch serves the whole burst.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

/// Headers never included in a fingerprint or a stored response.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Deterministic fingerprint of the cacheable request material.
pub fn fingerprint(
    api_id: &str,
    method: &str,
    path: &str,
    query: Option<&str>,
    body: Option<&[u8]>,
) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(api_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(method.as_bytes());
    hasher.update(b"\0");
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    if let Some(query) = query {
        hasher.update(query.as_bytes());
    }
    hasher.update(b"\0");
    if let Some(body) = body {
        hasher.update(body);
    }
    hasher.digest()
}

/// A stored response.
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    stored_at: Instant,
    ttl: Duration,
}

impl CachedResponse {
    pub fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stores: AtomicU64,
}

/// The outcome of entering the cache for a fingerprint.
pub enum CacheEntry {
    /// Fresh entry; respond from cache
    Hit(Arc<CachedResponse>),
    /// Miss; the caller is the fetch leader and must call
    /// [`FetchGuard::store`] or drop the guard to release waiters
    Miss(FetchGuard),
}

/// Leadership over an in-flight fetch. Dropping without storing releases
/// waiting requests to fetch for themselves.
pub struct FetchGuard {
    cache: Arc<CacheInner>,
    key: u64,
}

impl FetchGuard {
    /// Publish the response under the fingerprint.
    pub fn store(self, status: u16, headers: Vec<(String, String)>, body: Bytes, ttl: Duration) {
        let headers = headers
            .into_iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .collect();
        self.cache.entries.insert(
            self.key,
            Arc::new(CachedResponse {
                status,
                headers,
                body,
                stored_at: Instant::now(),
                ttl,
            }),
        );
        self.cache.stats.stores.fetch_add(1, Ordering::Relaxed);
        trace!(key = self.key, "Stored response in cache");
    }

    pub fn key(&self) -> u64 {
        self.key
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if let Some((_, latch)) = self.cache.inflight.remove(&self.key) {
            latch.notify_waiters();
        }
    }
}

struct CacheInner {
    entries: DashMap<u64, Arc<CachedResponse>>,
    inflight: DashMap<u64, Arc<Notify>>,
    stats: CacheStats,
}

/// Fingerprint→response cache with single-flight fetches.
pub struct ResponseCache {
    inner: Arc<CacheInner>,
    /// How long a follower waits for the leader before fetching itself
    follower_wait: Duration,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                stats: CacheStats::default(),
            }),
            follower_wait: Duration::from_secs(2),
        }
    }

    /// Fast read without joining the single-flight protocol.
    pub fn peek(&self, key: u64) -> Option<Arc<CachedResponse>> {
        match self.inner.entries.get(&key) {
            Some(entry) if entry.is_fresh() => Some(Arc::clone(&entry)),
            Some(_) => {
                drop(self.inner.entries.remove(&key));
                None
            }
            None => None,
        }
    }

    /// Look up a fingerprint, becoming the fetch leader on a miss.
    pub async fn lookup(&self, key: u64) -> CacheEntry {
        loop {
            if let Some(entry) = self.peek(key) {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return CacheEntry::Hit(entry);
            }

            let latch = Arc::new(Notify::new());
            match self.inner.inflight.entry(key) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&latch));
                    self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(key = key, "Cache miss, leading the fetch");
                    return CacheEntry::Miss(FetchGuard {
                        cache: Arc::clone(&self.inner),
                        key,
                    });
                }
                dashmap::mapref::entry::Entry::Occupied(slot) => {
                    let existing = Arc::clone(slot.get());
                    drop(slot);
                    trace!(key = key, "Following an in-flight fetch");
                    let _ =
                        tokio::time::timeout(self.follower_wait, existing.notified()).await;
                    // Loop: either the entry landed, or leadership is free
                }
            }
        }
    }

    pub fn invalidate(&self, key: u64) {
        self.inner.entries.remove(&key);
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.inner.stats.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.stats.misses.load(Ordering::Relaxed)
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_discriminating() {
        let a = fingerprint("api", "GET", "/items", Some("x=1"), None);
        let b = fingerprint("api", "GET", "/items", Some("x=1"), None);
        assert_eq!(a, b);

        assert_ne!(a, fingerprint("api", "POST", "/items", Some("x=1"), None));
        assert_ne!(a, fingerprint("api", "GET", "/other", Some("x=1"), None));
        assert_ne!(a, fingerprint("api", "GET", "/items", Some("x=2"), None));
        assert_ne!(a, fingerprint("other", "GET", "/items", Some("x=1"), None));
        assert_ne!(
            a,
            fingerprint("api", "GET", "/items", Some("x=1"), Some(b"body"))
        );
    }

    #[tokio::test]
    async fn store_then_hit() {
        let cache = ResponseCache::new();
        let key = fingerprint("api", "GET", "/items", None, None);

        let CacheEntry::Miss(guard) = cache.lookup(key).await else {
            panic!("first lookup must miss");
        };
        guard.store(
            200,
            vec![("content-type".into(), "application/json".into())],
            Bytes::from_static(b"[]"),
            Duration::from_secs(60),
        );

        let CacheEntry::Hit(entry) = cache.lookup(key).await else {
            panic!("second lookup must hit");
        };
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body.as_ref(), b"[]");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn stale_entries_expire() {
        let cache = ResponseCache::new();
        let key = fingerprint("api", "GET", "/x", None, None);

        let CacheEntry::Miss(guard) = cache.lookup(key).await else {
            panic!("must miss");
        };
        guard.store(200, vec![], Bytes::new(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.peek(key).is_none());
    }

    #[tokio::test]
    async fn hop_by_hop_headers_never_stored() {
        let cache = ResponseCache::new();
        let key = fingerprint("api", "GET", "/h", None, None);

        let CacheEntry::Miss(guard) = cache.lookup(key).await else {
            panic!("must miss");
        };
        guard.store(
            200,
            vec![
                ("Connection".into(), "keep-alive".into()),
                ("Content-Type".into(), "text/plain".into()),
                ("Transfer-Encoding".into(), "chunked".into()),
            ],
            Bytes::from_static(b"ok"),
            Duration::from_secs(60),
        );

        let entry = cache.peek(key).unwrap();
        assert_eq!(entry.headers.len(), 1);
        assert_eq!(entry.headers[0].0, "Content-Type");
    }

    #[tokio::test]
    async fn followers_wait_for_the_leader() {
        let cache = Arc::new(ResponseCache::new());
        let key = fingerprint("api", "GET", "/sf", None, None);

        let CacheEntry::Miss(guard) = cache.lookup(key).await else {
            panic!("must miss");
        };

        let follower_cache = Arc::clone(&cache);
        let follower = tokio::spawn(async move { follower_cache.lookup(key).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.store(
            200,
            vec![],
            Bytes::from_static(b"leader"),
            Duration::from_secs(60),
        );

        match follower.await.unwrap() {
            CacheEntry::Hit(entry) => assert_eq!(entry.body.as_ref(), b"leader"),
            CacheEntry::Miss(_) => panic!("follower should observe the stored entry"),
        }
    }

    #[tokio::test]
    async fn abandoned_leader_releases_followers() {
        let cache = Arc::new(ResponseCache::new());
        let key = fingerprint("api", "GET", "/abandon", None, None);

        let CacheEntry::Miss(guard) = cache.lookup(key).await else {
            panic!("must miss");
        };

        let follower_cache = Arc::clone(&cache);
        let follower = tokio::spawn(async move { follower_cache.lookup(key).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard); // leader abandons without storing

        match follower.await.unwrap() {
            CacheEntry::Miss(_) => {}
            CacheEntry::Hit(_) => panic!("follower should take over leadership"),
        }
    }
}
