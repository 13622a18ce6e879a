//! Typed change events
//!
//! One [`Notification`] describes one committed mutation. Events are built
//! inside a transaction, stamped with a commit-ordered sequence number at
//! commit, and then shared read-only with every subscriber.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{CollectionId, Item, ItemId, Relation, TagId};

/// Entity families a subscriber can restrict itself to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Items,
    Collections,
    Tags,
    Relations,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Items => "ITEMS",
            EntityKind::Collections => "COLLECTIONS",
            EntityKind::Tags => "TAGS",
            EntityKind::Relations => "RELATIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ITEMS" => Some(EntityKind::Items),
            "COLLECTIONS" => Some(EntityKind::Collections),
            "TAGS" => Some(EntityKind::Tags),
            "RELATIONS" => Some(EntityKind::Relations),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemOperation {
    Add,
    Modify,
    ModifyFlags,
    ModifyTags,
    ModifyRelations,
    Move,
    Remove,
    Link,
    Unlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionOperation {
    Add,
    Modify,
    Move,
    Remove,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagOperation {
    Add,
    Modify,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationOperation {
    Add,
    Remove,
}

/// Identity of an item as carried in events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedItem {
    pub id: ItemId,
    pub remote_id: Option<String>,
    pub remote_revision: Option<String>,
    pub mime_type: String,
}

impl From<&Item> for NotifiedItem {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            remote_id: item.remote_id.clone(),
            remote_revision: item.remote_revision.clone(),
            mime_type: item.mime_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChange {
    pub operation: ItemOperation,
    pub items: Vec<NotifiedItem>,
    pub resource: String,
    /// Parent collection, or the virtual collection for link/unlink
    pub collection: CollectionId,
    pub destination_resource: Option<String>,
    pub destination_collection: Option<CollectionId>,
    /// Changed part names for `Modify`
    #[serde(default)]
    pub parts: BTreeSet<String>,
    #[serde(default)]
    pub added_flags: BTreeSet<String>,
    #[serde(default)]
    pub removed_flags: BTreeSet<String>,
    #[serde(default)]
    pub added_tags: BTreeSet<TagId>,
    #[serde(default)]
    pub removed_tags: BTreeSet<TagId>,
    #[serde(default)]
    pub added_relations: Vec<Relation>,
    #[serde(default)]
    pub removed_relations: Vec<Relation>,
}

impl ItemChange {
    pub fn new(
        operation: ItemOperation,
        items: Vec<NotifiedItem>,
        resource: impl Into<String>,
        collection: CollectionId,
    ) -> Self {
        Self {
            operation,
            items,
            resource: resource.into(),
            collection,
            destination_resource: None,
            destination_collection: None,
            parts: BTreeSet::new(),
            added_flags: BTreeSet::new(),
            removed_flags: BTreeSet::new(),
            added_tags: BTreeSet::new(),
            removed_tags: BTreeSet::new(),
            added_relations: Vec::new(),
            removed_relations: Vec::new(),
        }
    }

    pub fn item_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.items.iter().map(|i| i.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionChange {
    pub operation: CollectionOperation,
    pub id: CollectionId,
    pub remote_id: Option<String>,
    pub resource: String,
    pub parent: Option<CollectionId>,
    pub destination_resource: Option<String>,
    pub destination_parent: Option<CollectionId>,
    /// Changed property names for `Modify`
    #[serde(default)]
    pub changed: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagChange {
    pub operation: TagOperation,
    pub id: TagId,
    pub gid: String,
    /// Set when the event targets one owning resource
    pub resource: Option<String>,
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationChange {
    pub operation: RelationOperation,
    pub relation: Relation,
}

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Item(ItemChange),
    Collection(CollectionChange),
    Tag(TagChange),
    Relation(RelationChange),
}

impl Change {
    pub fn kind(&self) -> EntityKind {
        match self {
            Change::Item(_) => EntityKind::Items,
            Change::Collection(_) => EntityKind::Collections,
            Change::Tag(_) => EntityKind::Tags,
            Change::Relation(_) => EntityKind::Relations,
        }
    }
}

/// A change event as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Commit-ordered sequence number; 0 until published
    pub sequence: u64,
    /// Session that performed the mutation
    pub session: String,
    pub change: Change,
}

impl Notification {
    pub fn new(session: impl Into<String>, change: Change) -> Self {
        Self {
            sequence: 0,
            session: session.into(),
            change,
        }
    }

    pub fn item(&self) -> Option<&ItemChange> {
        match &self.change {
            Change::Item(c) => Some(c),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<&CollectionChange> {
        match &self.change {
            Change::Collection(c) => Some(c),
            _ => None,
        }
    }
}
