//! Change sets applied to existing entities

use std::collections::{BTreeMap, BTreeSet};

use super::{CachePolicy, CollectionId, Part, TagId};

/// Modifications to an item, applied atomically by one STORE
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemChanges {
    pub added_flags: BTreeSet<String>,
    pub removed_flags: BTreeSet<String>,
    /// Replace the whole flag set
    pub flags: Option<BTreeSet<String>>,
    pub added_tags: BTreeSet<TagId>,
    pub removed_tags: BTreeSet<TagId>,
    /// Replace the whole tag set
    pub tags: Option<BTreeSet<TagId>>,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub gid: Option<String>,
    /// Parts to create or overwrite
    pub parts: Vec<Part>,
    pub removed_parts: BTreeSet<String>,
    pub dirty: Option<bool>,
}

impl ItemChanges {
    pub fn add_flag(mut self, flag: impl Into<String>) -> Self {
        self.added_flags.insert(flag.into());
        self
    }

    pub fn remove_flag(mut self, flag: impl Into<String>) -> Self {
        self.removed_flags.insert(flag.into());
        self
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether any flag is touched
    pub fn touches_flags(&self) -> bool {
        self.flags.is_some() || !self.added_flags.is_empty() || !self.removed_flags.is_empty()
    }

    /// Whether any tag is touched
    pub fn touches_tags(&self) -> bool {
        self.tags.is_some() || !self.added_tags.is_empty() || !self.removed_tags.is_empty()
    }
}

/// Modifications to a collection's own attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionChanges {
    pub name: Option<String>,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub mime_types: Option<Vec<String>>,
    pub cache_policy: Option<CachePolicy>,
    pub attributes: BTreeMap<String, Vec<u8>>,
    pub removed_attributes: BTreeSet<String>,
    /// Reparent as part of the modification
    pub parent: Option<CollectionId>,
}

impl CollectionChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Names of the changed properties, as reported in notifications
    pub fn changed_parts(&self) -> BTreeSet<String> {
        let mut parts = BTreeSet::new();
        if self.name.is_some() {
            parts.insert("NAME".to_string());
        }
        if self.remote_id.is_some() {
            parts.insert("REMOTEID".to_string());
        }
        if self.remote_revision.is_some() {
            parts.insert("REMOTEREVISION".to_string());
        }
        if self.mime_types.is_some() {
            parts.insert("MIMETYPE".to_string());
        }
        if self.cache_policy.is_some() {
            parts.insert("CACHEPOLICY".to_string());
        }
        for key in self.attributes.keys().chain(self.removed_attributes.iter()) {
            parts.insert(key.clone());
        }
        parts
    }
}

/// Modifications to a tag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagChanges {
    pub gid: Option<String>,
    pub parent_id: Option<Option<TagId>>,
    pub tag_type: Option<String>,
    /// Remote id for the session's selected resource
    pub remote_id: Option<String>,
    pub attributes: BTreeMap<String, Vec<u8>>,
    pub removed_attributes: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_parts_lists_attributes() {
        let mut changes = CollectionChanges {
            name: Some("Archive".into()),
            ..Default::default()
        };
        changes.attributes.insert("color".into(), b"red".to_vec());
        changes.removed_attributes.insert("icon".into());
        let parts: Vec<_> = changes.changed_parts().into_iter().collect();
        assert_eq!(parts, vec!["NAME", "color", "icon"]);
    }

    #[test]
    fn test_item_changes_builders() {
        let changes = ItemChanges::default().add_flag("\\SEEN");
        assert!(changes.touches_flags());
        assert!(!changes.touches_tags());
        assert!(ItemChanges::default().is_empty());
    }
}
