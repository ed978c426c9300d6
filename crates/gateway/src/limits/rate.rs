//! Rate limiter strategies.
//!
//! One strategy is active gateway-wide, selected by configuration:
//!
//! - **Token bucket** (default): store-side counter with a TTL per window.
//! - **Rolling window**: sliding window of request timestamps retained for
//!   the period; admission iff the window holds no more than the limit.
//! - **Fixed window**: counter in a wall-clock aligned bucket.
//!
//! An optional node-local advisory pre-filter rejects without touching the
//! store once this node has already seen the full allowance in its window;
//! it is only honored for single-node deployments.

use chrono::Utc;
use dashmap::DashMap;
use pingora_limits::rate::Rate;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use gantry_config::{RateLimitConfig, RateLimitStrategy};
use gantry_common::GatewayResult;

use crate::storage::KeyValueStore;

/// Outcome of a rate check, also feeding the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Absolute epoch seconds when the window resets
    pub reset_at: i64,
}

/// Gateway-wide rate limiter.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    strategy: RateLimitStrategy,
    advisory: Option<DashMap<String, Arc<Rate>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &RateLimitConfig) -> Self {
        let advisory = if config.enable_node_advisory {
            Some(DashMap::new())
        } else {
            None
        };
        Self {
            store,
            strategy: config.strategy,
            advisory,
        }
    }

    fn counter_key(key_hash: &str, api_id: &str) -> String {
        format!("RL-{}-{}", key_hash, api_id)
    }

    /// Check and consume one request for `(session key, api)`.
    ///
    /// `rate` requests are allowed per `per` seconds. A non-positive rate
    /// disables limiting for the session.
    pub async fn allow(
        &self,
        key_hash: &str,
        api_id: &str,
        rate: f64,
        per: f64,
    ) -> GatewayResult<RateDecision> {
        let now = Utc::now().timestamp();
        if rate <= 0.0 || per <= 0.0 {
            return Ok(RateDecision {
                allowed: true,
                limit: 0,
                remaining: 0,
                reset_at: now,
            });
        }
        let limit = rate as u64;
        let period = Duration::from_secs_f64(per);
        let key = Self::counter_key(key_hash, api_id);

        // Node-local advisory: skip the store entirely once this node has
        // seen the full allowance in its own window.
        if let Some(advisory) = &self.advisory {
            let local = advisory
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Rate::new(period)))
                .clone();
            let observed = local.observe(&(), 1);
            if observed > limit as isize {
                trace!(key = %key, observed = observed, "Advisory layer rejected without store hit");
                return Ok(RateDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at: now + per as i64,
                });
            }
        }

        match self.strategy {
            RateLimitStrategy::TokenBucket => {
                let count = self.store.incr(&key).await?;
                if count == 1 {
                    self.store.expire(&key, period).await?;
                }
                let ttl = self
                    .store
                    .ttl(&key)
                    .await?
                    .unwrap_or(period)
                    .as_secs() as i64;
                let allowed = count <= limit as i64;
                Ok(RateDecision {
                    allowed,
                    limit,
                    remaining: (limit as i64 - count).max(0) as u64,
                    reset_at: now + ttl,
                })
            }
            RateLimitStrategy::RollingWindow => {
                let now_ms = Utc::now().timestamp_millis() as f64;
                let count = self.store.window_count(&key, now_ms, period).await?;
                let allowed = count <= limit as i64;
                Ok(RateDecision {
                    allowed,
                    limit,
                    remaining: (limit as i64 - count).max(0) as u64,
                    reset_at: now + per as i64,
                })
            }
            RateLimitStrategy::FixedWindow => {
                let per_secs = per as i64;
                let window_start = now - now.rem_euclid(per_secs);
                let bucket = format!("{}:{}", key, window_start);
                let count = self.store.incr(&bucket).await?;
                if count == 1 {
                    self.store.expire(&bucket, period).await?;
                }
                let allowed = count <= limit as i64;
                Ok(RateDecision {
                    allowed,
                    limit,
                    remaining: (limit as i64 - count).max(0) as u64,
                    reset_at: window_start + per_secs,
                })
            }
        }
    }
}
