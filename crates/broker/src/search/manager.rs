//! Ad-hoc and persistent searches
//!
//! A persistent search is a virtual collection below the search root whose
//! stored [`SearchSpec`] is re-run against the provider. Membership is
//! reconciled by diff, so only the delta produces link/unlink events.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::{Notify, watch};

use super::provider::{SearchProvider, SearchRequest};
use crate::config::SearchConfig;
use crate::error::BrokerError;
use crate::models::{Collection, CollectionId, Item, ItemId, SearchSpec};
use crate::storage::{ItemFilter, SEARCH_RESOURCE, Store, Transaction};

/// Session name persistent-search maintenance runs under
pub const SEARCH_SESSION: &str = "search";

pub struct SearchManager {
    store: Arc<Store>,
    provider: Arc<dyn SearchProvider>,
    result_limit: usize,
    update_delay: Duration,
    wakeup: Notify,
}

impl SearchManager {
    pub fn new(store: Arc<Store>, provider: Arc<dyn SearchProvider>, config: &SearchConfig) -> Self {
        Self {
            store,
            provider,
            result_limit: config.result_limit,
            update_delay: Duration::from_millis(config.update_delay_ms),
            wakeup: Notify::new(),
        }
    }

    /// Concrete collections a spec covers; empty means everywhere
    fn resolve_scope(&self, tx: &Transaction<'_>, spec: &SearchSpec) -> Result<Vec<CollectionId>> {
        let mut scope = BTreeSet::new();
        for id in &spec.collections {
            let ids = if spec.recursive {
                tx.descendant_ids(*id)?
            } else {
                vec![tx.require_collection(*id)?.id]
            };
            for id in ids {
                if tx.collection(id)?.is_some_and(|c| !c.is_virtual) {
                    scope.insert(id);
                }
            }
        }
        Ok(scope.into_iter().collect())
    }

    /// Provider request for `spec`, or None when its scope holds no
    /// concrete collection
    fn request_for(&self, tx: &Transaction<'_>, spec: &SearchSpec) -> Result<Option<SearchRequest>> {
        let collections = self.resolve_scope(tx, spec)?;
        if !spec.collections.is_empty() && collections.is_empty() {
            return Ok(None);
        }
        Ok(Some(SearchRequest {
            query: spec.query.clone(),
            collections,
            mime_types: spec.mime_types.clone(),
            limit: self.result_limit,
        }))
    }

    /// Run the provider for `spec`. The scope is read in its own short
    /// transaction so no write lock is held while the provider works.
    fn query(&self, session: &str, spec: &SearchSpec) -> Result<BTreeSet<ItemId>> {
        let tx = self.store.begin_read(session)?;
        let request = self.request_for(&tx, spec)?;
        tx.rollback()?;
        match request {
            Some(request) => self.provider.search(&request),
            None => Ok(BTreeSet::new()),
        }
    }

    /// The subset of `found` that still exists
    fn existing(tx: &Transaction<'_>, found: BTreeSet<ItemId>) -> Result<BTreeSet<ItemId>> {
        if found.is_empty() {
            return Ok(found);
        }
        Ok(tx
            .items(&ItemFilter::ids(found))?
            .into_iter()
            .map(|item| item.id)
            .collect())
    }

    /// Run a one-off search
    pub fn search(&self, tx: &Transaction<'_>, spec: &SearchSpec) -> Result<Vec<Item>> {
        let ids = match self.request_for(tx, spec)? {
            Some(request) => Self::existing(tx, self.provider.search(&request)?)?,
            None => BTreeSet::new(),
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        tx.items(&ItemFilter::ids(ids))
    }

    /// Create a persistent search, or redefine the one with that name, and
    /// populate it
    pub fn create_persistent(&self, session: &str, name: &str, spec: SearchSpec) -> Result<Collection> {
        if spec.query.trim().is_empty() {
            return Err(BrokerError::syntax("Empty search query").into());
        }
        let found = self.query(session, &spec)?;

        let mut tx = self.store.begin(session)?;
        let root = tx.search_root()?;
        let existing = tx
            .children(Some(root.id))?
            .into_iter()
            .find(|c| c.name == name);

        let collection = match existing {
            Some(mut collection) => {
                tx.set_search_spec(collection.id, &spec)?;
                collection.search = Some(spec);
                collection
            }
            None => {
                let mut collection = Collection::new(name, Some(root.id));
                collection.is_virtual = true;
                collection.resource = SEARCH_RESOURCE.to_string();
                collection.mime_types = spec.mime_types.clone();
                collection.search = Some(spec);
                tx.append_collection(&mut collection)?;
                collection
            }
        };

        let (added, removed) = Self::apply(&mut tx, collection.id, found)?;
        tx.commit()?;
        info!(
            "Persistent search {} ({}) holds {} new, {} dropped items",
            collection.id, name, added, removed
        );
        Ok(collection)
    }

    /// Link and unlink so the collection holds exactly the existing items
    /// of `found`; returns (linked, unlinked)
    fn apply(tx: &mut Transaction<'_>, collection: CollectionId, found: BTreeSet<ItemId>) -> Result<(usize, usize)> {
        // links of items deleted since the last run are gone with the item
        let wanted = Self::existing(tx, found)?;
        let current = tx.linked_item_ids(collection)?;

        let to_link: Vec<ItemId> = wanted.difference(&current).copied().collect();
        let to_unlink: Vec<ItemId> = current.difference(&wanted).copied().collect();

        let linked = if to_link.is_empty() {
            0
        } else {
            tx.link_items(collection, &to_link)?.len()
        };
        let unlinked = if to_unlink.is_empty() {
            0
        } else {
            tx.unlink_items(collection, &to_unlink)?.len()
        };
        Ok((linked, unlinked))
    }

    /// Re-run one persistent search and commit the difference; returns
    /// (linked, unlinked)
    pub fn refresh(&self, collection: &Collection) -> Result<(usize, usize)> {
        let Some(spec) = collection.search.as_ref() else {
            return Ok((0, 0));
        };
        let found = self.query(SEARCH_SESSION, spec)?;

        let mut tx = self.store.begin(SEARCH_SESSION)?;
        if tx.collection(collection.id)?.is_none() {
            debug!("Persistent search {} went away during refresh", collection.id);
            tx.rollback()?;
            return Ok((0, 0));
        }
        let changes = Self::apply(&mut tx, collection.id, found)?;
        tx.commit()?;
        Ok(changes)
    }

    /// Refresh every persistent search, each in its own transaction;
    /// returns how many changed
    pub fn refresh_all(&self) -> Result<usize> {
        let tx = self.store.begin_read(SEARCH_SESSION)?;
        let collections = tx.search_collections()?;
        tx.rollback()?;

        let mut changed = 0;
        for collection in &collections {
            let (linked, unlinked) = self
                .refresh(collection)
                .with_context(|| format!("Refreshing persistent search {}", collection.id))?;
            if linked + unlinked > 0 {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("Refreshed {} of {} persistent searches", changed, collections.len());
        }
        Ok(changed)
    }

    /// Ask the update loop to refresh persistent searches soon
    pub fn request_refresh(&self) {
        self.wakeup.notify_one();
    }

    /// Debounced refresh loop: a wakeup is followed by the update delay so
    /// bursts of changes produce one refresh
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            tokio::time::sleep(self.update_delay).await;

            let manager = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || manager.refresh_all()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Persistent search refresh failed: {:#}", e),
                Err(e) => warn!("Persistent search refresh panicked: {}", e),
            }
        }
        debug!("Search updater stopped");
    }
}
