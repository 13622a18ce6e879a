//! Relation model: a typed link between two items

use serde::{Deserialize, Serialize};

use super::ItemId;

/// Link between two items, independent of collection membership
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub left: ItemId,
    pub right: ItemId,
    pub relation_type: String,
    pub remote_id: Option<String>,
}

impl Relation {
    pub const GENERIC: &'static str = "GENERIC";

    pub fn new(left: ItemId, right: ItemId, relation_type: impl Into<String>) -> Self {
        Self {
            left,
            right,
            relation_type: relation_type.into(),
            remote_id: None,
        }
    }

    /// Whether `item` is on either side of the relation
    pub fn involves(&self, item: ItemId) -> bool {
        self.left == item || self.right == item
    }
}
