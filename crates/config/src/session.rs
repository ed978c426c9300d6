//! Session state and policy application.
//!
//! A session is the runtime state attached to an authenticated identity:
//! applied policies, access rights, quota and rate counters, and metadata.
//! Sessions are persisted JSON-encoded in the key/value store and mutated
//! only through atomic store operations on the counter keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use gantry_common::{GatewayError, GatewayResult};

use crate::policy::{AccessDefinition, Policy};

/// Runtime state for one authenticated identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub org_id: String,
    /// Requests allowed per `per` seconds
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub per: f64,
    /// Unix timestamp after which the session is invalid; 0 never expires
    #[serde(default)]
    pub expires: i64,
    /// Total requests per renewal window; negative means unlimited
    #[serde(default)]
    pub quota_max: i64,
    #[serde(default)]
    pub quota_remaining: i64,
    /// Unix timestamp of the next quota renewal
    #[serde(default)]
    pub quota_renews: i64,
    #[serde(default)]
    pub quota_renewal_rate: i64,
    #[serde(default)]
    pub access_rights: HashMap<String, AccessDefinition>,
    /// Policy ids applied to this session, in application order
    #[serde(default)]
    pub apply_policies: Vec<String>,
    /// SHA-256 hash of the basic-auth password, hex-encoded
    #[serde(default)]
    pub basic_auth_hash: Option<String>,
    /// Shared secret for HMAC signature validation
    #[serde(default)]
    pub hmac_secret: Option<String>,
    /// Client certificate fingerprint for mTLS-keyed sessions
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta_data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub is_inactive: bool,
    /// RFC 3339 timestamp of the last mutation
    #[serde(default)]
    pub last_updated: String,
}

impl SessionState {
    /// Whether the session has expired at `now` (unix seconds).
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires > 0 && self.expires < now
    }

    /// Look up the grant for an API, if any.
    pub fn access_for(&self, api_id: &str) -> Option<&AccessDefinition> {
        self.access_rights.get(api_id)
    }

    /// Effective rate limit for an API: the grant's override when set,
    /// otherwise the session-level limit.
    pub fn rate_for(&self, api_id: &str) -> (f64, f64) {
        if let Some(limit) = self
            .access_for(api_id)
            .and_then(|ad| ad.limit.as_ref())
            .filter(|l| l.rate > 0.0)
        {
            (limit.rate, limit.per)
        } else {
            (self.rate, self.per)
        }
    }

    /// Effective quota settings for an API: (quota_max, renewal_rate, scope).
    /// The scope is non-empty for per-API quotas.
    pub fn quota_for(&self, api_id: &str) -> (i64, i64, String) {
        if let Some(ad) = self.access_for(api_id) {
            if let Some(limit) = ad.limit.as_ref().filter(|l| l.quota_max != 0) {
                return (
                    limit.quota_max,
                    limit.quota_renewal_rate,
                    ad.allowance_scope.clone(),
                );
            }
        }
        (self.quota_max, self.quota_renewal_rate, String::new())
    }

    /// Apply the session's policy list.
    ///
    /// Merge is deterministic: unpartitioned fields come from the first
    /// applied policy; partitioned fields come from the policy owning that
    /// partition. Two policies claiming the same partition is an error, as
    /// is an unresolvable or inactive policy.
    pub fn apply_policies(
        &mut self,
        policies: &HashMap<String, Policy>,
    ) -> GatewayResult<()> {
        if self.apply_policies.is_empty() {
            return Ok(());
        }

        let mut rate_owner: Option<&str> = None;
        let mut quota_owner: Option<&str> = None;
        let mut acl_owner: Option<&str> = None;
        let mut base_applied = false;
        let mut merged_rights: HashMap<String, AccessDefinition> = HashMap::new();

        for policy_id in &self.apply_policies {
            let policy = policies.get(policy_id).ok_or_else(|| {
                GatewayError::forbidden(format!("Policy '{}' not found", policy_id))
            })?;
            if policy.is_inactive {
                return Err(GatewayError::forbidden(format!(
                    "Policy '{}' is inactive",
                    policy_id
                )));
            }

            let partitions = policy.partitions;
            if !partitions.any() {
                // Unpartitioned policy: the first one fully owns the session
                if base_applied {
                    continue;
                }
                base_applied = true;
                self.rate = policy.rate;
                self.per = policy.per;
                self.quota_max = policy.quota_max;
                self.quota_renewal_rate = policy.quota_renewal_rate;
                for (api_id, ad) in &policy.access_rights {
                    merged_rights.insert(api_id.clone(), ad.clone());
                }
                continue;
            }

            if partitions.rate_limit {
                if let Some(owner) = rate_owner {
                    return Err(GatewayError::forbidden(format!(
                        "Policies '{}' and '{}' both own the rate limit partition",
                        owner, policy_id
                    )));
                }
                rate_owner = Some(policy_id);
                self.rate = policy.rate;
                self.per = policy.per;
            }
            if partitions.quota {
                if let Some(owner) = quota_owner {
                    return Err(GatewayError::forbidden(format!(
                        "Policies '{}' and '{}' both own the quota partition",
                        owner, policy_id
                    )));
                }
                quota_owner = Some(policy_id);
                self.quota_max = policy.quota_max;
                self.quota_renewal_rate = policy.quota_renewal_rate;
            }
            if partitions.acl {
                if let Some(owner) = acl_owner {
                    return Err(GatewayError::forbidden(format!(
                        "Policies '{}' and '{}' both own the ACL partition",
                        owner, policy_id
                    )));
                }
                acl_owner = Some(policy_id);
                for (api_id, ad) in &policy.access_rights {
                    merged_rights.insert(api_id.clone(), ad.clone());
                }
            }
        }

        if !merged_rights.is_empty() {
            self.access_rights = merged_rights;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ApiLimit, PolicyPartitions};

    fn grant(api_id: &str) -> AccessDefinition {
        AccessDefinition {
            api_id: api_id.to_string(),
            api_name: api_id.to_string(),
            versions: vec!["Default".to_string()],
            ..Default::default()
        }
    }

    fn policy(id: &str, partitions: PolicyPartitions) -> Policy {
        Policy {
            id: id.to_string(),
            rate: 10.0,
            per: 60.0,
            quota_max: 100,
            quota_renewal_rate: 3600,
            partitions,
            access_rights: [(id.to_string(), grant(id))].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn first_unpartitioned_policy_wins() {
        let mut pols = HashMap::new();
        let mut first = policy("first", PolicyPartitions::default());
        first.rate = 5.0;
        let mut second = policy("second", PolicyPartitions::default());
        second.rate = 500.0;
        pols.insert("first".to_string(), first);
        pols.insert("second".to_string(), second);

        let mut session = SessionState {
            apply_policies: vec!["first".to_string(), "second".to_string()],
            ..Default::default()
        };
        session.apply_policies(&pols).unwrap();

        assert_eq!(session.rate, 5.0);
        assert!(session.access_rights.contains_key("first"));
        // Second unpartitioned policy contributes nothing
        assert!(!session.access_rights.contains_key("second"));
    }

    #[test]
    fn partitioned_fields_come_from_owner() {
        let mut pols = HashMap::new();
        let mut rate_pol = policy(
            "rates",
            PolicyPartitions {
                rate_limit: true,
                ..Default::default()
            },
        );
        rate_pol.rate = 42.0;
        rate_pol.per = 1.0;
        let mut quota_pol = policy(
            "quotas",
            PolicyPartitions {
                quota: true,
                ..Default::default()
            },
        );
        quota_pol.quota_max = 9999;
        pols.insert("rates".to_string(), rate_pol);
        pols.insert("quotas".to_string(), quota_pol);

        let mut session = SessionState {
            apply_policies: vec!["rates".to_string(), "quotas".to_string()],
            ..Default::default()
        };
        session.apply_policies(&pols).unwrap();

        assert_eq!(session.rate, 42.0);
        assert_eq!(session.quota_max, 9999);
    }

    #[test]
    fn conflicting_partition_owners_rejected() {
        let partitions = PolicyPartitions {
            quota: true,
            ..Default::default()
        };
        let mut pols = HashMap::new();
        pols.insert("a".to_string(), policy("a", partitions));
        pols.insert("b".to_string(), policy("b", partitions));

        let mut session = SessionState {
            apply_policies: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        assert!(session.apply_policies(&pols).is_err());
    }

    #[test]
    fn missing_policy_rejected() {
        let mut session = SessionState {
            apply_policies: vec!["ghost".to_string()],
            ..Default::default()
        };
        assert!(session.apply_policies(&HashMap::new()).is_err());
    }

    #[test]
    fn per_api_limit_overrides_session_limit() {
        let mut session = SessionState {
            rate: 10.0,
            per: 60.0,
            quota_max: 100,
            quota_renewal_rate: 3600,
            ..Default::default()
        };
        let mut ad = grant("httpbin");
        ad.limit = Some(ApiLimit {
            rate: 2.0,
            per: 1.0,
            quota_max: 5,
            quota_renewal_rate: 60,
        });
        ad.allowance_scope = "httpbin".to_string();
        session.access_rights.insert("httpbin".to_string(), ad);

        assert_eq!(session.rate_for("httpbin"), (2.0, 1.0));
        assert_eq!(session.rate_for("other"), (10.0, 60.0));
        let (qmax, qrate, scope) = session.quota_for("httpbin");
        assert_eq!((qmax, qrate), (5, 60));
        assert_eq!(scope, "httpbin");
    }

    #[test]
    fn expiry_check() {
        let session = SessionState {
            expires: 100,
            ..Default::default()
        };
        assert!(session.is_expired(200));
        assert!(!session.is_expired(50));

        let eternal = SessionState::default();
        assert!(!eternal.is_expired(i64::MAX));
    }
}
