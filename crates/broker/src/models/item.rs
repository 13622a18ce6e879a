//! Item model: a stored object and its named payload parts

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CollectionId, TagId};

entity_id!(
    /// Unique identifier for an item
    ItemId
);

/// Well-known flag names
pub mod flags {
    pub const SEEN: &str = "\\SEEN";
    pub const DELETED: &str = "\\DELETED";
    pub const FLAGGED: &str = "\\FLAGGED";
}

/// Part naming conventions
///
/// Payload parts carry a `PLD:` prefix and are subject to cache expiry.
/// Attribute parts carry `ATR:` and are kept with the item metadata.
pub mod parts {
    pub const PAYLOAD_PREFIX: &str = "PLD:";
    pub const ATTRIBUTE_PREFIX: &str = "ATR:";
    /// Full payload of an item
    pub const FULL_PAYLOAD: &str = "PLD:RFC822";
    /// Pseudo part meaning "every part" in cache policies and fetch scopes
    pub const ALL: &str = "ALL";

    pub fn is_payload(name: &str) -> bool {
        name.starts_with(PAYLOAD_PREFIX)
    }

    pub fn is_attribute(name: &str) -> bool {
        name.starts_with(ATTRIBUTE_PREFIX)
    }

    /// Whether a name is a syntactically valid part name
    pub fn is_valid(name: &str) -> bool {
        (is_payload(name) || is_attribute(name))
            && name.len() > PAYLOAD_PREFIX.len()
            && !name.contains(char::is_whitespace)
    }
}

/// A stored object (message, contact, event...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Incremented on every successful modification
    pub revision: i64,
    /// The single concrete collection owning this item
    pub collection_id: CollectionId,
    pub mime_type: String,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub gid: Option<String>,
    pub flags: BTreeSet<String>,
    pub tags: BTreeSet<TagId>,
    /// Sum of payload part sizes
    pub size: i64,
    pub mtime: DateTime<Utc>,
    /// Last full-payload access, consulted by the cache sweep
    pub atime: DateTime<Utc>,
    /// Has local changes the resource has not replayed yet
    pub dirty: bool,
}

impl Item {
    /// Create an unsaved item in `collection_id`
    pub fn new(collection_id: CollectionId, mime_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId(0),
            revision: 0,
            collection_id,
            mime_type: mime_type.into(),
            remote_id: None,
            remote_revision: None,
            gid: None,
            flags: BTreeSet::new(),
            tags: BTreeSet::new(),
            size: 0,
            mtime: now,
            atime: now,
            dirty: false,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn is_seen(&self) -> bool {
        self.flags.contains(flags::SEEN)
    }
}

/// A named payload fragment of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    /// None when the payload is not cached locally
    pub data: Option<Vec<u8>>,
    pub size: i64,
    pub version: i64,
}

impl Part {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as i64,
            data: Some(data),
            version: 0,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_names() {
        assert!(parts::is_payload("PLD:RFC822"));
        assert!(parts::is_attribute("ATR:color"));
        assert!(parts::is_valid("PLD:HEAD"));
        assert!(!parts::is_valid("PLD:"));
        assert!(!parts::is_valid("BODY"));
        assert!(!parts::is_valid("ATR:a b"));
    }

    #[test]
    fn test_new_part_size() {
        let part = Part::new("PLD:RFC822", b"hello".to_vec());
        assert_eq!(part.size, 5);
        assert!(part.is_cached());
    }

    #[test]
    fn test_seen_flag() {
        let item = Item::new(CollectionId(1), "message/rfc822").with_flag(flags::SEEN);
        assert!(item.is_seen());
    }
}
