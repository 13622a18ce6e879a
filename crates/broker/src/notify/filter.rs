//! Subscriber filters
//!
//! Decides whether a subscriber wants a given event. Ignored sessions are
//! checked first, then the `all` switch, then the entity kind, then the
//! entity-specific rules below.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::event::{
    Change, CollectionChange, CollectionOperation, EntityKind, ItemChange, ItemOperation,
    Notification, TagChange, TagOperation,
};
use crate::models::{CollectionId, ItemId, TagId};

/// Selection criteria of a monitor or change recorder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorFilter {
    /// Accept every event regardless of the other criteria
    pub all: bool,
    pub resources: BTreeSet<String>,
    /// Collection 0 stands for every collection
    pub collections: BTreeSet<CollectionId>,
    pub items: BTreeSet<ItemId>,
    pub mime_types: BTreeSet<String>,
    /// Empty accepts every tag
    pub tags: BTreeSet<TagId>,
    /// Empty accepts every kind
    pub types: BTreeSet<EntityKind>,
    /// Events caused by these sessions are dropped
    pub ignored_sessions: BTreeSet<String>,
}

impl MonitorFilter {
    /// Filter accepting everything
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    /// Filter accepting every event of the given kinds
    pub fn kinds(kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            types: kinds.into_iter().collect(),
            collections: [CollectionId(0)].into(),
            ..Default::default()
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    pub fn with_collection(mut self, collection: CollectionId) -> Self {
        self.collections.insert(collection);
        self
    }

    pub fn ignoring_session(mut self, session: impl Into<String>) -> Self {
        self.ignored_sessions.insert(session.into());
        self
    }

    pub fn accepts(&self, notification: &Notification) -> bool {
        if self.ignored_sessions.contains(&notification.session) {
            return false;
        }
        match &notification.change {
            Change::Item(change) => self.accepts_item(change),
            Change::Collection(change) => self.accepts_collection(change),
            Change::Tag(change) => self.accepts_tag(change),
            Change::Relation(_) => self.all || self.wants_kind(EntityKind::Relations),
        }
    }

    fn wants_kind(&self, kind: EntityKind) -> bool {
        self.types.is_empty() || self.types.contains(&kind)
    }

    fn is_collection_monitored(&self, id: Option<CollectionId>) -> bool {
        match id {
            Some(id) => {
                self.collections.contains(&id) || self.collections.contains(&CollectionId(0))
            }
            None => false,
        }
    }

    fn accepts_item(&self, change: &ItemChange) -> bool {
        if change.items.is_empty() {
            return false;
        }
        if self.all {
            return true;
        }
        if !self.wants_kind(EntityKind::Items) {
            return false;
        }

        if !self.resources.is_empty() || !self.mime_types.is_empty() {
            if self.resources.contains(&change.resource) {
                return true;
            }
            if change.operation == ItemOperation::Move
                && change
                    .destination_resource
                    .as_ref()
                    .is_some_and(|r| self.resources.contains(r))
            {
                return true;
            }
            return change
                .items
                .iter()
                .any(|item| self.mime_types.contains(&item.mime_type));
        }

        if change.item_ids().any(|id| self.items.contains(&id)) {
            return true;
        }
        self.is_collection_monitored(Some(change.collection))
            || self.is_collection_monitored(change.destination_collection)
    }

    fn accepts_collection(&self, change: &CollectionChange) -> bool {
        if self.all {
            return true;
        }
        if !self.wants_kind(EntityKind::Collections) {
            return false;
        }

        if !self.resources.is_empty() {
            let matches = self.resources.contains(&change.resource)
                || (change.operation == CollectionOperation::Move
                    && change
                        .destination_resource
                        .as_ref()
                        .is_some_and(|r| self.resources.contains(r)));
            if self.mime_types.is_empty() || matches {
                return matches;
            }
        }

        self.is_collection_monitored(Some(change.id))
            || self.is_collection_monitored(change.parent)
            || self.is_collection_monitored(change.destination_parent)
    }

    fn accepts_tag(&self, change: &TagChange) -> bool {
        // Removal fans out once per owning resource plus once for plain
        // clients; resources are recognised by ignoring their own session.
        if change.operation == TagOperation::Remove {
            match &change.resource {
                None if !self.ignored_sessions.is_empty() => return false,
                Some(resource) if !self.ignored_sessions.contains(resource) => return false,
                _ => {}
            }
        }
        if self.all {
            return true;
        }
        if !self.wants_kind(EntityKind::Tags) {
            return false;
        }
        self.tags.is_empty() || self.tags.contains(&change.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::event::{NotifiedItem, RelationChange, RelationOperation};
    use crate::models::Relation;

    fn item_event(operation: ItemOperation, resource: &str, collection: i64) -> Notification {
        let item = NotifiedItem {
            id: ItemId(7),
            remote_id: None,
            remote_revision: None,
            mime_type: "message/rfc822".into(),
        };
        Notification::new(
            "client",
            Change::Item(ItemChange::new(
                operation,
                vec![item],
                resource,
                CollectionId(collection),
            )),
        )
    }

    fn tag_removal(resource: Option<&str>) -> Notification {
        Notification::new(
            "client",
            Change::Tag(TagChange {
                operation: TagOperation::Remove,
                id: TagId(3),
                gid: "important".into(),
                resource: resource.map(String::from),
                remote_id: None,
            }),
        )
    }

    #[test]
    fn test_all_accepts_everything_but_ignored_sessions() {
        let filter = MonitorFilter::all().ignoring_session("client");
        assert!(!filter.accepts(&item_event(ItemOperation::Add, "imap", 4)));
        assert!(MonitorFilter::all().accepts(&item_event(ItemOperation::Add, "imap", 4)));
    }

    #[test]
    fn test_empty_filter_accepts_no_items() {
        assert!(!MonitorFilter::default().accepts(&item_event(ItemOperation::Add, "imap", 4)));
    }

    #[test]
    fn test_resource_filter() {
        let filter = MonitorFilter::default().with_resource("imap");
        assert!(filter.accepts(&item_event(ItemOperation::Add, "imap", 4)));
        assert!(!filter.accepts(&item_event(ItemOperation::Add, "maildir", 4)));
    }

    #[test]
    fn test_move_destination_resource_matches() {
        let filter = MonitorFilter::default().with_resource("maildir");
        let mut event = item_event(ItemOperation::Move, "imap", 4);
        if let Change::Item(change) = &mut event.change {
            change.destination_resource = Some("maildir".into());
            change.destination_collection = Some(CollectionId(9));
        }
        assert!(filter.accepts(&event));
    }

    #[test]
    fn test_mime_type_filter() {
        let filter = MonitorFilter {
            mime_types: ["message/rfc822".to_string()].into(),
            ..Default::default()
        };
        assert!(filter.accepts(&item_event(ItemOperation::Add, "imap", 4)));
    }

    #[test]
    fn test_collection_filter_and_wildcard() {
        let filter = MonitorFilter::default().with_collection(CollectionId(4));
        assert!(filter.accepts(&item_event(ItemOperation::Add, "imap", 4)));
        assert!(!filter.accepts(&item_event(ItemOperation::Add, "imap", 5)));

        let wildcard = MonitorFilter::default().with_collection(CollectionId(0));
        assert!(wildcard.accepts(&item_event(ItemOperation::Add, "imap", 5)));
    }

    #[test]
    fn test_type_restriction() {
        let filter = MonitorFilter::kinds([EntityKind::Collections]);
        assert!(!filter.accepts(&item_event(ItemOperation::Add, "imap", 4)));
        let relation = Notification::new(
            "client",
            Change::Relation(RelationChange {
                operation: RelationOperation::Add,
                relation: Relation::new(ItemId(1), ItemId(2), Relation::GENERIC),
            }),
        );
        assert!(!filter.accepts(&relation));
        assert!(MonitorFilter::kinds([EntityKind::Relations]).accepts(&relation));
    }

    #[test]
    fn test_tag_removal_routing() {
        let client = MonitorFilter::all();
        assert!(client.accepts(&tag_removal(None)));
        assert!(!client.accepts(&tag_removal(Some("imap"))));

        let resource = MonitorFilter::all().ignoring_session("imap");
        assert!(resource.accepts(&tag_removal(Some("imap"))));
        assert!(!resource.accepts(&tag_removal(None)));
        assert!(!resource.accepts(&tag_removal(Some("maildir"))));
    }
}
