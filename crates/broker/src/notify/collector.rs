//! Per-transaction event buffer
//!
//! Mutations append events here while their transaction is open. The buffer
//! is handed to the bus on commit and dropped on rollback. Repeated property
//! changes to the same entity are merged into the event already queued.

use std::collections::BTreeSet;

use super::event::{
    Change, CollectionChange, CollectionOperation, ItemChange, ItemOperation, NotifiedItem,
    Notification, RelationChange, RelationOperation, TagChange, TagOperation,
};
use crate::models::{Collection, CollectionId, Item, ItemId, Relation, Tag, TagId};

#[derive(Debug, Default)]
pub struct NotificationCollector {
    session: String,
    pending: Vec<Notification>,
}

impl NotificationCollector {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            pending: Vec::new(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> &[Notification] {
        &self.pending
    }

    /// Drain the buffer
    pub fn take(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn item_added(&mut self, item: &Item, resource: &str) {
        self.push(Change::Item(ItemChange::new(
            ItemOperation::Add,
            vec![NotifiedItem::from(item)],
            resource,
            item.collection_id,
        )));
    }

    pub fn item_changed(&mut self, item: &Item, resource: &str, parts: BTreeSet<String>) {
        self.item_changed_in(item, resource, item.collection_id, parts);
    }

    /// Modify event reported against `collection`, which may be a virtual
    /// collection the item is linked into
    pub fn item_changed_in(
        &mut self,
        item: &Item,
        resource: &str,
        collection: CollectionId,
        parts: BTreeSet<String>,
    ) {
        let mut change = ItemChange::new(
            ItemOperation::Modify,
            vec![NotifiedItem::from(item)],
            resource,
            collection,
        );
        change.parts = parts;
        self.push(Change::Item(change));
    }

    pub fn items_flags_changed(
        &mut self,
        items: &[Item],
        resource: &str,
        collection: CollectionId,
        added: BTreeSet<String>,
        removed: BTreeSet<String>,
    ) {
        let mut change = ItemChange::new(ItemOperation::ModifyFlags, notified(items), resource, collection);
        change.added_flags = added;
        change.removed_flags = removed;
        self.push(Change::Item(change));
    }

    pub fn items_tags_changed(
        &mut self,
        items: &[Item],
        resource: &str,
        collection: CollectionId,
        added: BTreeSet<TagId>,
        removed: BTreeSet<TagId>,
    ) {
        let mut change = ItemChange::new(ItemOperation::ModifyTags, notified(items), resource, collection);
        change.added_tags = added;
        change.removed_tags = removed;
        self.push(Change::Item(change));
    }

    pub fn items_relations_changed(
        &mut self,
        items: &[Item],
        resource: &str,
        collection: CollectionId,
        added: Vec<Relation>,
        removed: Vec<Relation>,
    ) {
        let mut change =
            ItemChange::new(ItemOperation::ModifyRelations, notified(items), resource, collection);
        change.added_relations = added;
        change.removed_relations = removed;
        self.push(Change::Item(change));
    }

    pub fn items_moved(
        &mut self,
        items: &[Item],
        source_resource: &str,
        source: CollectionId,
        destination_resource: &str,
        destination: CollectionId,
    ) {
        let mut change = ItemChange::new(ItemOperation::Move, notified(items), source_resource, source);
        change.destination_resource = Some(destination_resource.to_string());
        change.destination_collection = Some(destination);
        self.push(Change::Item(change));
    }

    pub fn items_removed(&mut self, items: &[Item], resource: &str, collection: CollectionId) {
        self.push(Change::Item(ItemChange::new(
            ItemOperation::Remove,
            notified(items),
            resource,
            collection,
        )));
    }

    pub fn items_linked(&mut self, items: &[Item], resource: &str, collection: CollectionId) {
        self.push(Change::Item(ItemChange::new(
            ItemOperation::Link,
            notified(items),
            resource,
            collection,
        )));
    }

    pub fn items_unlinked(&mut self, items: &[Item], resource: &str, collection: CollectionId) {
        self.push(Change::Item(ItemChange::new(
            ItemOperation::Unlink,
            notified(items),
            resource,
            collection,
        )));
    }

    pub fn collection_added(&mut self, collection: &Collection) {
        self.collection_event(CollectionOperation::Add, collection, BTreeSet::new());
    }

    pub fn collection_changed(&mut self, collection: &Collection, changed: BTreeSet<String>) {
        self.collection_event(CollectionOperation::Modify, collection, changed);
    }

    pub fn collection_moved(
        &mut self,
        collection: &Collection,
        source_resource: &str,
        source_parent: Option<CollectionId>,
    ) {
        self.push(Change::Collection(CollectionChange {
            operation: CollectionOperation::Move,
            id: collection.id,
            remote_id: collection.remote_id.clone(),
            resource: source_resource.to_string(),
            parent: source_parent,
            destination_resource: Some(collection.resource.clone()),
            destination_parent: collection.parent_id,
            changed: BTreeSet::new(),
        }));
    }

    pub fn collection_removed(&mut self, collection: &Collection) {
        self.collection_event(CollectionOperation::Remove, collection, BTreeSet::new());
    }

    pub fn collection_subscription_changed(&mut self, collection: &Collection, subscribed: bool) {
        let operation = if subscribed {
            CollectionOperation::Subscribe
        } else {
            CollectionOperation::Unsubscribe
        };
        self.collection_event(operation, collection, BTreeSet::new());
    }

    pub fn tag_added(&mut self, tag: &Tag) {
        self.tag_event(TagOperation::Add, tag, None, None);
    }

    pub fn tag_changed(&mut self, tag: &Tag) {
        self.tag_event(TagOperation::Modify, tag, None, None);
    }

    /// One event per owning resource carrying its remote id, plus one for clients
    pub fn tag_removed(&mut self, tag: &Tag, remote_ids: &[(String, Option<String>)]) {
        for (resource, remote_id) in remote_ids {
            self.tag_event(
                TagOperation::Remove,
                tag,
                Some(resource.clone()),
                remote_id.clone(),
            );
        }
        self.tag_event(TagOperation::Remove, tag, None, None);
    }

    pub fn relation_added(&mut self, relation: &Relation) {
        self.push(Change::Relation(RelationChange {
            operation: RelationOperation::Add,
            relation: relation.clone(),
        }));
    }

    pub fn relation_removed(&mut self, relation: &Relation) {
        self.push(Change::Relation(RelationChange {
            operation: RelationOperation::Remove,
            relation: relation.clone(),
        }));
    }

    fn collection_event(
        &mut self,
        operation: CollectionOperation,
        collection: &Collection,
        changed: BTreeSet<String>,
    ) {
        self.push(Change::Collection(CollectionChange {
            operation,
            id: collection.id,
            remote_id: collection.remote_id.clone(),
            resource: collection.resource.clone(),
            parent: collection.parent_id,
            destination_resource: None,
            destination_parent: None,
            changed,
        }));
    }

    fn tag_event(
        &mut self,
        operation: TagOperation,
        tag: &Tag,
        resource: Option<String>,
        remote_id: Option<String>,
    ) {
        self.push(Change::Tag(TagChange {
            operation,
            id: tag.id,
            gid: tag.gid.clone(),
            resource,
            remote_id,
        }));
    }

    /// Queue an event, merging it into a compatible queued one
    pub fn push(&mut self, change: Change) {
        if self.merge(&change) {
            return;
        }
        self.pending.push(Notification::new(self.session.clone(), change));
    }

    fn merge(&mut self, incoming: &Change) -> bool {
        // Only the latest queued event touching these entities may absorb
        // the new one; merging past it would reorder the two.
        let Some(last) = self
            .pending
            .iter_mut()
            .rev()
            .find(|n| overlaps(&n.change, incoming))
        else {
            return false;
        };
        if !same_target(&last.change, incoming) {
            return false;
        }
        match (&mut last.change, incoming) {
            (Change::Collection(queued), Change::Collection(new)) => {
                queued.changed.extend(new.changed.iter().cloned());
                queued.remote_id = new.remote_id.clone();
                true
            }
            (Change::Item(queued), Change::Item(new)) => match new.operation {
                ItemOperation::Modify => {
                    queued.parts.extend(new.parts.iter().cloned());
                    queued.items = new.items.clone();
                    true
                }
                ItemOperation::ModifyFlags => {
                    merge_sets(&mut queued.added_flags, &mut queued.removed_flags, &new.added_flags, &new.removed_flags);
                    queued.items = new.items.clone();
                    true
                }
                ItemOperation::ModifyTags => {
                    merge_sets(&mut queued.added_tags, &mut queued.removed_tags, &new.added_tags, &new.removed_tags);
                    queued.items = new.items.clone();
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

fn notified(items: &[Item]) -> Vec<NotifiedItem> {
    items.iter().map(NotifiedItem::from).collect()
}

/// Whether two events describe property changes of the same entity set
fn same_target(queued: &Change, incoming: &Change) -> bool {
    match (queued, incoming) {
        (Change::Collection(a), Change::Collection(b)) => {
            a.operation == CollectionOperation::Modify
                && b.operation == CollectionOperation::Modify
                && a.id == b.id
        }
        (Change::Item(a), Change::Item(b)) => {
            a.operation == b.operation
                && matches!(
                    a.operation,
                    ItemOperation::Modify | ItemOperation::ModifyFlags | ItemOperation::ModifyTags
                )
                && a.collection == b.collection
                && a.item_ids().eq(b.item_ids())
        }
        _ => false,
    }
}

/// Whether two events concern at least one common entity
fn overlaps(queued: &Change, incoming: &Change) -> bool {
    match (queued, incoming) {
        (Change::Collection(a), Change::Collection(b)) => a.id == b.id,
        (Change::Item(a), Change::Item(b)) => {
            let ids: BTreeSet<ItemId> = b.item_ids().collect();
            a.item_ids().any(|id| ids.contains(&id))
        }
        _ => false,
    }
}

/// Fold a later add/remove pair into an earlier one; a later add cancels an
/// earlier remove and vice versa
fn merge_sets<T: Ord + Clone>(
    added: &mut BTreeSet<T>,
    removed: &mut BTreeSet<T>,
    new_added: &BTreeSet<T>,
    new_removed: &BTreeSet<T>,
) {
    for value in new_added {
        removed.remove(value);
        added.insert(value.clone());
    }
    for value in new_removed {
        added.remove(value);
        removed.insert(value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemId, flags};

    fn item(id: i64) -> Item {
        let mut item = Item::new(CollectionId(4), "message/rfc822");
        item.id = ItemId(id);
        item
    }

    fn collection(id: i64) -> Collection {
        let mut col = Collection::new("Inbox", Some(CollectionId(1)));
        col.id = CollectionId(id);
        col.resource = "imap".into();
        col
    }

    #[test]
    fn test_collection_modifies_coalesce() {
        let mut collector = NotificationCollector::new("s1");
        collector.collection_changed(&collection(5), ["NAME".to_string()].into());
        collector.collection_changed(&collection(5), ["color".to_string()].into());
        collector.collection_changed(&collection(6), ["NAME".to_string()].into());

        let events = collector.take();
        assert_eq!(events.len(), 2);
        let first = events[0].collection().unwrap();
        assert_eq!(first.changed, ["NAME".to_string(), "color".to_string()].into());
        assert!(collector.is_empty());
    }

    #[test]
    fn test_flag_changes_merge_and_cancel() {
        let mut collector = NotificationCollector::new("s1");
        let items = [item(9)];
        collector.items_flags_changed(
            &items,
            "imap",
            CollectionId(4),
            [flags::SEEN.to_string()].into(),
            BTreeSet::new(),
        );
        collector.items_flags_changed(
            &items,
            "imap",
            CollectionId(4),
            [flags::FLAGGED.to_string()].into(),
            [flags::SEEN.to_string()].into(),
        );

        let events = collector.take();
        assert_eq!(events.len(), 1);
        let change = events[0].item().unwrap();
        assert_eq!(change.added_flags, [flags::FLAGGED.to_string()].into());
        assert_eq!(change.removed_flags, [flags::SEEN.to_string()].into());
    }

    #[test]
    fn test_distinct_operations_do_not_merge() {
        let mut collector = NotificationCollector::new("s1");
        let it = item(9);
        collector.item_added(&it, "imap");
        collector.item_changed(&it, "imap", ["PLD:RFC822".to_string()].into());
        collector.item_changed(&it, "imap", ["PLD:HEAD".to_string()].into());
        collector.items_removed(&[it], "imap", CollectionId(4));

        let events = collector.take();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].item().unwrap().parts.len(), 2);
        assert!(events.iter().all(|e| e.session == "s1" && e.sequence == 0));
    }

    #[test]
    fn test_flag_changes_do_not_merge_across_a_move() {
        let mut collector = NotificationCollector::new("s1");
        let items = [item(9)];
        let seen = || -> BTreeSet<String> { [flags::SEEN.to_string()].into() };
        collector.items_flags_changed(&items, "imap", CollectionId(4), seen(), BTreeSet::new());
        collector.items_moved(&items, "imap", CollectionId(4), "imap", CollectionId(5));
        collector.items_moved(&items, "imap", CollectionId(5), "imap", CollectionId(4));
        collector.items_flags_changed(&items, "imap", CollectionId(4), BTreeSet::new(), seen());

        let events = collector.take();
        let ops: Vec<_> = events.iter().map(|e| e.item().unwrap().operation).collect();
        assert_eq!(
            ops,
            vec![
                ItemOperation::ModifyFlags,
                ItemOperation::Move,
                ItemOperation::Move,
                ItemOperation::ModifyFlags,
            ]
        );
        assert_eq!(events[3].item().unwrap().removed_flags, seen());
    }

    #[test]
    fn test_unrelated_event_between_changes_still_merges() {
        let mut collector = NotificationCollector::new("s1");
        collector.collection_changed(&collection(5), ["NAME".to_string()].into());
        collector.items_removed(&[item(9)], "imap", CollectionId(4));
        collector.collection_changed(&collection(5), ["color".to_string()].into());
        assert_eq!(collector.take().len(), 2);
    }

    #[test]
    fn test_tag_removal_fans_out_per_resource() {
        let mut collector = NotificationCollector::new("s1");
        let mut tag = Tag::new("important");
        tag.id = TagId(3);
        collector.tag_removed(
            &tag,
            &[("imap".to_string(), Some("rid-1".to_string())), ("dav".to_string(), None)],
        );
        let events = collector.take();
        assert_eq!(events.len(), 3);
        let resources: Vec<Option<String>> = events
            .iter()
            .map(|e| match &e.change {
                Change::Tag(t) => t.resource.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(
            resources,
            vec![Some("imap".to_string()), Some("dav".to_string()), None]
        );
    }
}
