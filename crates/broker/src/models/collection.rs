//! Collection model: a named node in a per-resource tree

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

entity_id!(
    /// Unique identifier for a collection
    CollectionId
);

/// Retention and refresh rules for a collection's cached payload
///
/// Intervals and timeouts are in minutes; `-1` disables them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Use the nearest non-inheriting ancestor's policy instead of this one
    pub inherit: bool,
    /// Minutes between background syncs of the collection
    pub check_interval: i32,
    /// Minutes an unaccessed payload stays cached
    pub cache_timeout: i32,
    /// Sync the collection whenever a client lists its contents
    pub sync_on_demand: bool,
    /// Parts that are always kept locally; `ALL` keeps everything
    pub local_parts: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            inherit: true,
            ..Self::system_default()
        }
    }
}

impl CachePolicy {
    /// Policy applied when no ancestor defines one
    pub fn system_default() -> Self {
        Self {
            inherit: false,
            check_interval: -1,
            cache_timeout: -1,
            sync_on_demand: false,
            local_parts: vec![crate::models::parts::ALL.to_string()],
        }
    }

    /// Whether the cache sweep has any work to do under this policy
    pub fn expires_payload(&self) -> bool {
        self.cache_timeout > -1 && !self.keeps_all_parts()
    }

    /// Whether the interval check schedules periodic syncs under this policy
    pub fn has_check_interval(&self) -> bool {
        self.check_interval > 0
    }

    pub fn keeps_all_parts(&self) -> bool {
        self.local_parts.iter().any(|p| p == crate::models::parts::ALL)
    }

    /// Whether a payload part with this name survives the cache sweep
    pub fn keeps_part(&self, name: &str) -> bool {
        self.keeps_all_parts() || self.local_parts.iter().any(|p| p == name)
    }
}

/// Persistent search definition stored on a virtual collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub query: String,
    /// Collections the search is limited to; empty means everywhere
    #[serde(default)]
    pub collections: Vec<CollectionId>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub mime_types: Vec<String>,
}

/// Item count, total payload size and unseen count of one collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub count: i64,
    pub size: i64,
    pub unseen: i64,
}

/// A collection (folder)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    /// None for a resource's root collection
    pub parent_id: Option<CollectionId>,
    /// Owning resource name
    pub resource: String,
    pub name: String,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    /// Mime types this collection may contain
    pub mime_types: Vec<String>,
    pub cache_policy: CachePolicy,
    pub subscribed: bool,
    pub is_virtual: bool,
    pub attributes: BTreeMap<String, Vec<u8>>,
    /// Incremented on every successful modification
    pub revision: i64,
    /// Set only on persistent search collections
    pub search: Option<SearchSpec>,
}

impl Collection {
    /// Create an unsaved collection under `parent_id`
    pub fn new(name: impl Into<String>, parent_id: Option<CollectionId>) -> Self {
        Self {
            id: CollectionId(0),
            parent_id,
            resource: String::new(),
            name: name.into(),
            remote_id: None,
            remote_revision: None,
            mime_types: Vec::new(),
            cache_policy: CachePolicy::default(),
            subscribed: true,
            is_virtual: false,
            attributes: BTreeMap::new(),
            revision: 0,
            search: None,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_mime_types(mut self, mime_types: Vec<String>) -> Self {
        self.mime_types = mime_types;
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_inherits() {
        let policy = CachePolicy::default();
        assert!(policy.inherit);
        assert!(!policy.expires_payload());
        assert!(!CachePolicy::system_default().inherit);
    }

    #[test]
    fn test_expiry_requires_timeout_and_partial_local_parts() {
        let mut policy = CachePolicy {
            inherit: false,
            check_interval: 10,
            cache_timeout: 5,
            sync_on_demand: false,
            local_parts: vec!["PLD:HEAD".into()],
        };
        assert!(policy.expires_payload());
        assert!(policy.keeps_part("PLD:HEAD"));
        assert!(!policy.keeps_part("PLD:RFC822"));

        policy.local_parts.push("ALL".into());
        assert!(!policy.expires_payload());

        policy.local_parts = vec![];
        policy.cache_timeout = -1;
        assert!(!policy.expires_payload());
    }
}
