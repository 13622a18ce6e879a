//! Tag model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

entity_id!(
    /// Unique identifier for a tag
    TagId
);

/// A label shared across items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    /// Global id, stable across resources
    pub gid: String,
    pub parent_id: Option<TagId>,
    pub tag_type: String,
    /// Remote id for the currently selected resource, if any
    pub remote_id: Option<String>,
    pub attributes: BTreeMap<String, Vec<u8>>,
}

impl Tag {
    pub const DEFAULT_TYPE: &'static str = "PLAIN";

    pub fn new(gid: impl Into<String>) -> Self {
        Self {
            id: TagId(0),
            gid: gid.into(),
            parent_id: None,
            tag_type: Self::DEFAULT_TYPE.to_string(),
            remote_id: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Display name, stored as the `NAME` attribute
    pub fn name(&self) -> Option<String> {
        self.attributes
            .get("NAME")
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}
