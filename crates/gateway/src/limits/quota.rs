//! Quota enforcement.
//!
//! Quota is independent of rate limiting: a total request allowance over a
//! renewal window. The counter lives in the store and is incremented
//! atomically on admission; a renewal timestamp sidecar resets the window.
//! Threshold crossings emit trigger events at most once per window.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use gantry_common::GatewayResult;

use crate::events::{GatewayEvent, Notifier};
use crate::storage::KeyValueStore;

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Absolute epoch seconds of the next renewal
    pub renews_at: i64,
    /// Thresholds first crossed by this request
    pub thresholds_crossed: Vec<f64>,
}

impl QuotaDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: -1,
            remaining: -1,
            renews_at: 0,
            thresholds_crossed: Vec::new(),
        }
    }
}

/// Enforces per-key, per-API quotas over a renewal window.
pub struct QuotaManager {
    store: Arc<dyn KeyValueStore>,
    thresholds: Vec<f64>,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn KeyValueStore>, thresholds: Vec<f64>) -> Self {
        Self { store, thresholds }
    }

    fn counter_key(key_hash: &str, scope: &str) -> String {
        if scope.is_empty() {
            format!("quota-{}", key_hash)
        } else {
            format!("quota-{}-{}", key_hash, scope)
        }
    }

    /// Record one admission attempt against the quota.
    ///
    /// `scope` is the allowance scope: an api id for per-API quotas, empty
    /// for the key-global quota. `quota_max < 0` means unlimited; `0`
    /// means quotas are not configured for this session.
    pub async fn record(
        &self,
        key_hash: &str,
        scope: &str,
        quota_max: i64,
        renewal_rate: i64,
    ) -> GatewayResult<QuotaDecision> {
        if quota_max == 0 || renewal_rate <= 0 {
            return Ok(QuotaDecision::unlimited());
        }

        let now = Utc::now().timestamp();
        let counter = Self::counter_key(key_hash, scope);
        let renews_key = format!("{}:renews", counter);

        // Window renewal: when the stored renewal time has passed, the
        // counter restarts and the renewal advances.
        let mut renews_at = self
            .store
            .get(&renews_key)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        if renews_at != 0 && now >= renews_at {
            debug!(key = %counter, "Quota window renewed");
            self.store.delete(&counter).await?;
            renews_at = 0;
        }
        if renews_at == 0 {
            renews_at = now + renewal_rate;
            self.store
                .set(
                    &renews_key,
                    &renews_at.to_string(),
                    Some(Duration::from_secs(renewal_rate as u64)),
                )
                .await?;
        }

        if quota_max < 0 {
            return Ok(QuotaDecision {
                renews_at,
                ..QuotaDecision::unlimited()
            });
        }

        let count = self.store.incr(&counter).await?;
        if count == 1 {
            self.store
                .expire(&counter, Duration::from_secs(renewal_rate as u64))
                .await?;
        }

        let allowed = count <= quota_max;
        let remaining = (quota_max - count).max(0);

        let mut crossed = Vec::new();
        for &threshold in &self.thresholds {
            if (count as f64) >= (quota_max as f64) * threshold {
                let marker = format!("{}:trigger:{}", counter, threshold);
                if self.store.get(&marker).await?.is_none() {
                    let ttl = (renews_at - now).max(1) as u64;
                    self.store
                        .set(&marker, "1", Some(Duration::from_secs(ttl)))
                        .await?;
                    crossed.push(threshold);
                }
            }
        }

        if !allowed {
            warn!(key = %key_hash, scope = %scope, "Quota exhausted");
        }

        Ok(QuotaDecision {
            allowed,
            limit: quota_max,
            remaining,
            renews_at,
            thresholds_crossed: crossed,
        })
    }

    /// Emit trigger events for crossed thresholds.
    pub fn emit_triggers(
        &self,
        notifier: &Notifier,
        decision: &QuotaDecision,
        key_hash: &str,
        api_id: &str,
        org_id: &str,
    ) {
        for &threshold in &decision.thresholds_crossed {
            notifier.emit(GatewayEvent::QuotaThreshold {
                key_hash: key_hash.to_string(),
                api_id: api_id.to_string(),
                org_id: org_id.to_string(),
                remaining: decision.remaining,
                threshold,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn manager() -> QuotaManager {
        QuotaManager::new(Arc::new(MemoryStore::new()), vec![0.8, 1.0])
    }

    #[tokio::test]
    async fn quota_counts_down_and_exhausts() {
        let quotas = manager();

        let first = quotas.record("key", "", 2, 3600).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = quotas.record("key", "", 2, 3600).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = quotas.record("key", "", 2, 3600).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn remaining_is_strictly_decreasing_while_admitted() {
        let quotas = manager();
        let mut last = i64::MAX;
        let mut admitted = 0;
        for _ in 0..10 {
            let decision = quotas.record("key", "", 5, 3600).await.unwrap();
            if decision.allowed {
                assert!(decision.remaining < last);
                last = decision.remaining;
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn scoped_quotas_are_independent() {
        let quotas = manager();

        assert!(quotas.record("key", "api-a", 1, 3600).await.unwrap().allowed);
        assert!(quotas.record("key", "api-b", 1, 3600).await.unwrap().allowed);
        assert!(!quotas.record("key", "api-a", 1, 3600).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn thresholds_fire_once_per_window() {
        let quotas = manager();

        // 10-request quota: 80% threshold crosses at request 8
        for i in 1..=7 {
            let decision = quotas.record("key", "", 10, 3600).await.unwrap();
            assert!(
                decision.thresholds_crossed.is_empty(),
                "no threshold at request {}",
                i
            );
        }
        let eighth = quotas.record("key", "", 10, 3600).await.unwrap();
        assert_eq!(eighth.thresholds_crossed, vec![0.8]);

        let ninth = quotas.record("key", "", 10, 3600).await.unwrap();
        assert!(ninth.thresholds_crossed.is_empty());

        let tenth = quotas.record("key", "", 10, 3600).await.unwrap();
        assert_eq!(tenth.thresholds_crossed, vec![1.0]);

        // Over-quota requests re-cross nothing
        let over = quotas.record("key", "", 10, 3600).await.unwrap();
        assert!(over.thresholds_crossed.is_empty());
    }

    #[tokio::test]
    async fn unlimited_and_unconfigured_quotas_admit() {
        let quotas = manager();
        assert!(quotas.record("key", "", 0, 3600).await.unwrap().allowed);
        assert!(quotas.record("key", "", -1, 3600).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn window_renewal_resets_counter() {
        let quotas = manager();

        assert!(quotas.record("key", "", 1, 1).await.unwrap().allowed);
        assert!(!quotas.record("key", "", 1, 1).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let renewed = quotas.record("key", "", 1, 1).await.unwrap();
        assert!(renewed.allowed);
        assert_eq!(renewed.remaining, 0);
    }
}
