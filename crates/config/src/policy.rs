//! Policy and access-rights model.
//!
//! A [`Policy`] is a reusable bundle of access rights and limits that can be
//! applied to a session. Partition flags mark which field groups the policy
//! is authoritative for when several policies apply to one session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A URL pattern plus the methods allowed on it. The pattern is a regex
/// evaluated against the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSpec {
    pub url: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Rate and quota limits attached to one API grant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiLimit {
    /// Requests allowed per `per` seconds
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub per: f64,
    /// Total requests per renewal window; negative means unlimited
    #[serde(default)]
    pub quota_max: i64,
    #[serde(default)]
    pub quota_renewal_rate: i64,
}

impl ApiLimit {
    pub fn is_unset(&self) -> bool {
        self.rate == 0.0 && self.quota_max == 0
    }
}

/// Per-endpoint rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMethod {
    pub name: String,
    #[serde(default)]
    pub limit: ApiLimit,
}

/// An endpoint with per-method limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<EndpointMethod>,
}

/// Field-level access grant (GraphQL-shaped APIs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAccess {
    pub type_name: String,
    pub field_name: String,
}

/// One API grant inside a policy or session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessDefinition {
    #[serde(default)]
    pub api_name: String,
    pub api_id: String,
    /// Version names this grant admits; empty admits the default version
    #[serde(default)]
    pub versions: Vec<String>,
    /// Allowed URL patterns; empty admits every path
    #[serde(default)]
    pub allowed_urls: Vec<AccessSpec>,
    /// Per-API limit override; unset inherits the session limit
    #[serde(default)]
    pub limit: Option<ApiLimit>,
    #[serde(default)]
    pub field_access_rights: Vec<FieldAccess>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Quota scope: set to the api id for per-API quotas, empty for the
    /// session-global quota
    #[serde(default)]
    pub allowance_scope: String,
}

/// Which field groups a policy owns when merged into a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPartitions {
    #[serde(default)]
    pub quota: bool,
    #[serde(default)]
    pub rate_limit: bool,
    #[serde(default)]
    pub acl: bool,
}

impl PolicyPartitions {
    pub fn any(&self) -> bool {
        self.quota || self.rate_limit || self.acl
    }
}

/// A reusable bundle of access rights and limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub access_rights: HashMap<String, AccessDefinition>,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub per: f64,
    #[serde(default)]
    pub quota_max: i64,
    #[serde(default)]
    pub quota_renewal_rate: i64,
    #[serde(default)]
    pub partitions: PolicyPartitions,
    #[serde(default)]
    pub is_inactive: bool,
    /// Seconds a key referencing this policy lives after creation; 0 keeps
    /// the session's own expiry
    #[serde(default)]
    pub key_expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_deserializes_with_partitions() {
        let pol: Policy = serde_json::from_str(
            r#"{
                "id": "gold",
                "rate": 100.0,
                "per": 60.0,
                "quota_max": 10000,
                "quota_renewal_rate": 3600,
                "partitions": { "rate_limit": true },
                "access_rights": {
                    "httpbin": { "api_id": "httpbin", "versions": ["Default"] }
                }
            }"#,
        )
        .unwrap();

        assert!(pol.partitions.rate_limit);
        assert!(!pol.partitions.quota);
        assert!(pol.partitions.any());
        assert_eq!(pol.access_rights["httpbin"].api_id, "httpbin");
    }

    #[test]
    fn api_limit_unset_detection() {
        assert!(ApiLimit::default().is_unset());
        let limit = ApiLimit {
            rate: 10.0,
            per: 60.0,
            ..Default::default()
        };
        assert!(!limit.is_unset());
    }
}
