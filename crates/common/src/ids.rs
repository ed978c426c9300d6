//! Type-safe identifier newtypes for the Gantry gateway.
//!
//! [`ApiId`] identifies a published API and keys the snapshot index;
//! `Borrow<str>` lets callers look specs up with plain string slices.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Identifier of a published API definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiId(String);

impl ApiId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApiId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for ApiId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Generate a unique node instance id, presented to the remote config
/// service until it assigns one.
pub fn generate_instance_id() -> String {
    format!("gantry-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn api_id_roundtrip() {
        let id = ApiId::new("httpbin");
        assert_eq!(id.as_str(), "httpbin");
        assert_eq!(id.to_string(), "httpbin");

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""httpbin""#);
        let back: ApiId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn maps_keyed_by_api_id_accept_str_lookups() {
        let mut map: HashMap<ApiId, u32> = HashMap::new();
        map.insert(ApiId::new("httpbin"), 1);

        assert_eq!(map.get("httpbin"), Some(&1));
        assert_eq!(map["httpbin"], 1);
        assert!(!map.contains_key("other"));
    }

    #[test]
    fn instance_ids_are_unique() {
        assert_ne!(generate_instance_id(), generate_instance_id());
    }
}
