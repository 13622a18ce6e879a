//! Background indexer
//!
//! Follows item and collection notifications and keeps the item index in
//! step with storage. Each batch is applied in one read transaction and one
//! index commit, after which persistent searches are asked to refresh.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::watch;

use super::index::{IndexedItem, ItemIndex};
use super::manager::{SEARCH_SESSION, SearchManager};
use crate::models::{CollectionId, ItemId};
use crate::notify::{
    Change, CollectionOperation, EntityKind, ItemOperation, Monitor, MonitorFilter, Notification,
};
use crate::storage::{ItemFilter, SEARCH_RESOURCE, Store};

/// Largest number of notifications folded into one batch
const MAX_BATCH: usize = 500;

/// Statistics from one batch or rebuild
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub indexed: usize,
    pub removed: usize,
    pub collections_removed: usize,
}

impl IndexStats {
    pub fn is_empty(&self) -> bool {
        self.indexed == 0 && self.removed == 0 && self.collections_removed == 0
    }
}

pub struct SearchIndexer {
    store: Arc<Store>,
    index: Arc<ItemIndex>,
    manager: Option<Arc<SearchManager>>,
}

impl SearchIndexer {
    pub fn new(store: Arc<Store>, index: Arc<ItemIndex>, manager: Option<Arc<SearchManager>>) -> Self {
        Self {
            store,
            index,
            manager,
        }
    }

    /// Notifications the indexer cares about
    pub fn filter() -> MonitorFilter {
        MonitorFilter::kinds([EntityKind::Items, EntityKind::Collections])
            .ignoring_session(SEARCH_SESSION)
    }

    pub fn monitor(&self) -> Result<Monitor> {
        self.store.bus().monitor(Self::filter())
    }

    pub fn index_is_empty(&self) -> bool {
        self.index.num_docs() == 0
    }

    /// Apply a batch of notifications to the index
    pub fn apply(&self, notifications: &[Arc<Notification>]) -> Result<IndexStats> {
        let mut reindex = BTreeSet::new();
        let mut delete = BTreeSet::new();
        let mut dropped_collections: BTreeSet<CollectionId> = BTreeSet::new();

        for notification in notifications {
            match &notification.change {
                Change::Item(change) => {
                    if change.resource == SEARCH_RESOURCE {
                        continue;
                    }
                    match change.operation {
                        ItemOperation::Add
                        | ItemOperation::Modify
                        | ItemOperation::ModifyFlags
                        | ItemOperation::ModifyTags
                        | ItemOperation::Move => {
                            for id in change.item_ids() {
                                delete.remove(&id);
                                reindex.insert(id);
                            }
                        }
                        ItemOperation::Remove => {
                            for id in change.item_ids() {
                                reindex.remove(&id);
                                delete.insert(id);
                            }
                        }
                        ItemOperation::ModifyRelations | ItemOperation::Link | ItemOperation::Unlink => {}
                    }
                }
                Change::Collection(change) if change.operation == CollectionOperation::Remove => {
                    dropped_collections.insert(change.id);
                }
                _ => {}
            }
        }

        let mut stats = IndexStats::default();
        for id in &dropped_collections {
            self.index.delete_collection(*id)?;
            stats.collections_removed += 1;
        }

        if !reindex.is_empty() {
            let tx = self.store.begin_read(SEARCH_SESSION)?;
            let items = tx.items(&ItemFilter::ids(reindex.iter().copied()))?;
            let found: BTreeSet<ItemId> = items.iter().map(|i| i.id).collect();
            for item in &items {
                let parts = tx.parts_of(item.id, None)?;
                self.index.index_item(&IndexedItem::from_item(item, &parts))?;
                stats.indexed += 1;
            }
            tx.rollback()?;
            // gone again by the time the batch ran
            delete.extend(reindex.difference(&found).copied());
        }

        for id in &delete {
            self.index.delete_item(*id)?;
            stats.removed += 1;
        }

        if !stats.is_empty() {
            self.index.commit()?;
            if let Some(manager) = &self.manager {
                manager.request_refresh();
            }
        }
        Ok(stats)
    }

    /// Drop the index and index every concrete item again
    pub fn reindex_all(&self) -> Result<IndexStats> {
        self.index.clear()?;
        let mut stats = IndexStats::default();
        let tx = self.store.begin_read(SEARCH_SESSION)?;
        for collection in tx.all_collections()? {
            if collection.is_virtual {
                continue;
            }
            for item in tx.items_in_collection(collection.id)? {
                let parts = tx.parts_of(item.id, None)?;
                self.index.index_item(&IndexedItem::from_item(&item, &parts))?;
                stats.indexed += 1;
            }
        }
        tx.rollback()?;
        self.index.commit()?;
        info!("Rebuilt search index with {} items", stats.indexed);
        Ok(stats)
    }

    /// Follow `monitor` until shutdown, applying notifications in batches
    pub async fn run(self: Arc<Self>, mut monitor: Monitor, mut shutdown: watch::Receiver<bool>) {
        loop {
            let first = tokio::select! {
                next = monitor.recv() => match next {
                    Some(n) => n,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match monitor.try_recv() {
                    Some(n) => batch.push(n),
                    None => break,
                }
            }

            let indexer = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || indexer.apply(&batch)).await {
                Ok(Ok(stats)) if !stats.is_empty() => debug!("Indexed batch: {:?}", stats),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Indexing batch failed: {:#}", e),
                Err(e) => warn!("Indexing batch panicked: {}", e),
            }
        }
        debug!("Search indexer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::{Collection, Item, ItemChanges, Part, flags};
    use crate::search::parse_query;
    use tempfile::{TempDir, tempdir};

    fn setup() -> Result<(TempDir, Arc<Store>, SearchIndexer, Monitor, CollectionId)> {
        let dir = tempdir()?;
        let store = Arc::new(Store::open(dir.path(), &StorageConfig::default())?);
        let mut tx = store.begin("test")?;
        let mut root = Collection::new("dav", None);
        root.resource = "dav".into();
        tx.append_collection(&mut root)?;
        tx.commit()?;

        let indexer = SearchIndexer::new(Arc::clone(&store), Arc::new(ItemIndex::in_memory()?), None);
        let monitor = indexer.monitor()?;
        Ok((dir, store, indexer, monitor, root.id))
    }

    fn drain(monitor: &mut Monitor) -> Vec<Arc<Notification>> {
        std::iter::from_fn(|| monitor.try_recv()).collect()
    }

    fn hits(indexer: &SearchIndexer, query: &str) -> Result<Vec<ItemId>> {
        indexer.index.search(&parse_query(query), &[], &[], 10)
    }

    #[test]
    fn test_follows_item_lifecycle() -> Result<()> {
        let (_dir, store, indexer, mut monitor, root) = setup()?;

        let mut tx = store.begin("client")?;
        let mut item = Item::new(root, "text/calendar");
        tx.append_item(&mut item, &[Part::new("PLD:RFC822", b"BEGIN:VEVENT dentist".to_vec())])?;
        tx.commit()?;

        let stats = indexer.apply(&drain(&mut monitor))?;
        assert_eq!(stats.indexed, 1);
        assert_eq!(hits(&indexer, "dentist")?, vec![item.id]);

        let mut tx = store.begin("client")?;
        tx.update_item(item.id, None, &ItemChanges::default().add_flag(flags::FLAGGED))?;
        tx.commit()?;
        indexer.apply(&drain(&mut monitor))?;
        assert_eq!(hits(&indexer, "is:flagged")?, vec![item.id]);

        let mut tx = store.begin("client")?;
        tx.remove_items(&[item.id])?;
        tx.commit()?;
        let stats = indexer.apply(&drain(&mut monitor))?;
        assert_eq!(stats.removed, 1);
        assert!(hits(&indexer, "dentist")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_collection_removal_drops_documents() -> Result<()> {
        let (_dir, store, indexer, mut monitor, root) = setup()?;
        let mut tx = store.begin("client")?;
        let mut calendar = Collection::new("Calendar", Some(root));
        tx.append_collection(&mut calendar)?;
        let mut item = Item::new(calendar.id, "text/calendar");
        tx.append_item(&mut item, &[Part::new("PLD:RFC822", b"standup".to_vec())])?;
        tx.commit()?;
        indexer.apply(&drain(&mut monitor))?;
        assert_eq!(hits(&indexer, "standup")?.len(), 1);

        let mut tx = store.begin("client")?;
        tx.remove_collection(calendar.id)?;
        tx.commit()?;
        let stats = indexer.apply(&drain(&mut monitor))?;
        assert_eq!(stats.collections_removed, 1);
        assert!(hits(&indexer, "standup")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_reindex_all() -> Result<()> {
        let (_dir, store, indexer, _monitor, root) = setup()?;
        let mut tx = store.begin("client")?;
        for body in ["alpha", "beta"] {
            let mut item = Item::new(root, "text/plain");
            tx.append_item(&mut item, &[Part::new("PLD:RFC822", body.as_bytes().to_vec())])?;
        }
        tx.commit()?;

        assert_eq!(indexer.reindex_all()?.indexed, 2);
        assert_eq!(hits(&indexer, "beta")?.len(), 1);
        Ok(())
    }
}
