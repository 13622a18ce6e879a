//! Item operations
//!
//! Every mutation bumps the item revision. Writers that present the revision
//! they last read get a conflict instead of overwriting a newer state.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use rusqlite::{Row, params};

use super::query::{CompareOperator, Condition, JoinType, QueryBuilder, SortOrder, SqlValue};
use super::Transaction;
use crate::error::BrokerError;
use crate::models::{
    CachePolicy, Collection, CollectionId, Item, ItemChanges, ItemId, Part, TagId, parts,
};

use CompareOperator::*;

const ITEM_COLUMNS: &[&str] = &[
    "items.id",
    "items.rev",
    "items.collection_id",
    "mime_types.name",
    "items.remote_id",
    "items.remote_revision",
    "items.gid",
    "items.size",
    "items.mtime",
    "items.atime",
    "items.dirty",
];

/// Selects items for reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    /// Inclusive id ranges, `None` upper bound is open; empty means any id
    pub ranges: Vec<(i64, Option<i64>)>,
    /// Owning concrete collections
    pub collections: Option<Vec<CollectionId>>,
    /// Virtual collections the items are linked into
    pub linked_to: Option<Vec<CollectionId>>,
    pub remote_id: Option<String>,
    /// Restrict to collections of this resource
    pub resource: Option<String>,
    pub mime_types: Vec<String>,
    pub changed_since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl ItemFilter {
    pub fn ids(ids: impl IntoIterator<Item = ItemId>) -> Self {
        Self {
            ranges: ids.into_iter().map(|id| (id.0, Some(id.0))).collect(),
            ..Default::default()
        }
    }

    pub fn ranges(ranges: Vec<(i64, Option<i64>)>) -> Self {
        Self {
            ranges,
            ..Default::default()
        }
    }

    /// Items owned by or linked into any of the collections
    pub fn in_collections(collections: &[Collection]) -> Self {
        let (linked, owned): (Vec<&Collection>, Vec<&Collection>) =
            collections.iter().partition(|c| c.is_virtual);
        Self {
            collections: Some(owned.iter().map(|c| c.id).collect()),
            linked_to: Some(linked.iter().map(|c| c.id).collect()),
            ..Default::default()
        }
    }

    pub fn with_remote_id(mut self, resource: impl Into<String>, remote_id: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self.remote_id = Some(remote_id.into());
        self
    }

    fn apply(&self, mut query: QueryBuilder) -> QueryBuilder {
        if !self.ranges.is_empty() {
            let mut any = Condition::or();
            for (lo, hi) in &self.ranges {
                let mut range = Condition::and().value("items.id", GreaterOrEqual, *lo);
                if let Some(hi) = hi {
                    range = range.value("items.id", LessOrEqual, *hi);
                }
                any = any.nested(range);
            }
            query = query.where_condition(any);
        }

        let mut membership = Condition::or();
        if let Some(collections) = &self.collections {
            membership = membership.values("items.collection_id", In, collections.iter().map(|c| c.0));
        }
        if let Some(linked) = &self.linked_to {
            if !linked.is_empty() {
                let links = QueryBuilder::select("virtual_links")
                    .column("virtual_links.item_id")
                    .where_in("virtual_links.collection_id", linked.iter().map(|c| c.0));
                membership = membership.sub_query("items.id", In, links);
            }
        }
        if !membership.is_empty() {
            query = query.where_condition(membership);
        }

        if let Some(remote_id) = &self.remote_id {
            query = query.where_value("items.remote_id", Equals, remote_id.as_str());
        }
        if let Some(resource) = &self.resource {
            let owned = QueryBuilder::select("collections")
                .column("collections.id")
                .join(
                    JoinType::Inner,
                    "resources",
                    Condition::and().column("resources.id", Equals, "collections.resource_id"),
                )
                .where_value("resources.name", Equals, resource.as_str());
            query = query.where_condition(Condition::and().sub_query("items.collection_id", In, owned));
        }
        if !self.mime_types.is_empty() {
            query = query.where_in(
                "mime_types.name",
                self.mime_types.iter().map(|m| m.to_ascii_lowercase()),
            );
        }
        if let Some(since) = self.changed_since {
            query = query.where_value("items.mtime", GreaterOrEqual, since.timestamp_millis());
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

/// Cached payload of one item that the expiry sweep may drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeCandidate {
    pub item: ItemId,
    pub parts: Vec<String>,
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: ItemId(row.get(0)?),
        revision: row.get(1)?,
        collection_id: CollectionId(row.get(2)?),
        mime_type: row.get(3)?,
        remote_id: row.get(4)?,
        remote_revision: row.get(5)?,
        gid: row.get(6)?,
        flags: BTreeSet::new(),
        tags: BTreeSet::new(),
        size: row.get(7)?,
        mtime: millis_to_time(row.get(8)?),
        atime: millis_to_time(row.get(9)?),
        dirty: row.get(10)?,
    })
}

fn base_query() -> QueryBuilder {
    QueryBuilder::select("items")
        .columns(ITEM_COLUMNS)
        .join(
            JoinType::Inner,
            "mime_types",
            Condition::and().column("mime_types.id", Equals, "items.mime_type_id"),
        )
        .order_by("items.id", SortOrder::Ascending)
}

/// Group items by owning collection, keeping first-seen order
pub(super) fn by_collection(items: Vec<Item>) -> Vec<(CollectionId, Vec<Item>)> {
    let mut groups: Vec<(CollectionId, Vec<Item>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(c, _)| *c == item.collection_id) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.collection_id, vec![item])),
        }
    }
    groups
}

impl Transaction<'_> {
    fn load_items(&self, query: QueryBuilder) -> Result<Vec<Item>> {
        let mut items = query.query(self.conn(), item_from_row)?;
        for item in &mut items {
            item.flags = self.item_flags(item.id)?;
            item.tags = self.item_tags(item.id)?;
        }
        Ok(items)
    }

    fn item_flags(&self, id: ItemId) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT flags.name FROM item_flags JOIN flags ON flags.id = item_flags.flag_id
             WHERE item_flags.item_id = ?1",
        )?;
        let flags = stmt
            .query_map([id.0], |row| row.get(0))?
            .collect::<Result<BTreeSet<String>, _>>()?;
        Ok(flags)
    }

    fn item_tags(&self, id: ItemId) -> Result<BTreeSet<TagId>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT tag_id FROM item_tags WHERE item_id = ?1")?;
        let tags = stmt
            .query_map([id.0], |row| row.get(0).map(TagId))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(tags)
    }

    pub fn item(&self, id: ItemId) -> Result<Option<Item>> {
        Ok(self.items(&ItemFilter::ids([id]))?.into_iter().next())
    }

    pub fn require_item(&self, id: ItemId) -> Result<Item> {
        self.item(id)?
            .ok_or_else(|| BrokerError::not_found("Item", id).into())
    }

    pub fn items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        self.load_items(filter.apply(base_query()))
    }

    /// Items owned by one concrete collection
    pub fn items_in_collection(&self, collection: CollectionId) -> Result<Vec<Item>> {
        self.items(&ItemFilter {
            collections: Some(vec![collection]),
            ..Default::default()
        })
    }

    /// Look up by remote id in one collection
    pub fn item_by_remote_id(&self, collection: CollectionId, remote_id: &str) -> Result<Option<Item>> {
        let filter = ItemFilter {
            collections: Some(vec![collection]),
            remote_id: Some(remote_id.to_string()),
            ..Default::default()
        };
        Ok(self.items(&filter)?.into_iter().next())
    }

    fn resource_of(&self, collection: CollectionId) -> Result<String> {
        Ok(self.require_collection(collection)?.resource)
    }

    fn write_flags(&self, id: ItemId, added: &BTreeSet<String>, removed: &BTreeSet<String>) -> Result<()> {
        for flag in added {
            let flag_id = self.flag_id(flag)?;
            self.conn().execute(
                "INSERT OR IGNORE INTO item_flags (item_id, flag_id) VALUES (?1, ?2)",
                params![id.0, flag_id],
            )?;
        }
        for flag in removed {
            let flag_id = self.flag_id(flag)?;
            self.conn().execute(
                "DELETE FROM item_flags WHERE item_id = ?1 AND flag_id = ?2",
                params![id.0, flag_id],
            )?;
        }
        Ok(())
    }

    fn write_tags(&self, id: ItemId, added: &BTreeSet<TagId>, removed: &BTreeSet<TagId>) -> Result<()> {
        for tag in added {
            self.require_tag(*tag)?;
            self.conn().execute(
                "INSERT OR IGNORE INTO item_tags (item_id, tag_id) VALUES (?1, ?2)",
                params![id.0, tag.0],
            )?;
        }
        for tag in removed {
            self.conn().execute(
                "DELETE FROM item_tags WHERE item_id = ?1 AND tag_id = ?2",
                params![id.0, tag.0],
            )?;
        }
        Ok(())
    }

    /// Recompute the cached size from the payload parts
    fn refresh_size(&self, id: ItemId) -> Result<()> {
        self.conn().execute(
            "UPDATE items SET size = (
                 SELECT COALESCE(SUM(datasize), 0) FROM parts
                 WHERE parts.item_id = ?1 AND parts.name LIKE 'PLD:%'
             ) WHERE id = ?1",
            [id.0],
        )?;
        Ok(())
    }

    /// Insert a new item with its parts; fills in `id`, `revision` and `size`
    pub fn append_item(&mut self, item: &mut Item, parts: &[Part]) -> Result<()> {
        let collection = self.require_collection(item.collection_id)?;
        if collection.is_virtual {
            return Err(BrokerError::constraint(format!(
                "Cannot append items to virtual collection {}",
                collection.id
            ))
            .into());
        }
        if item.mime_type.is_empty() {
            return Err(BrokerError::syntax("Item needs a mime type").into());
        }
        let mime_type = item.mime_type.to_ascii_lowercase();
        if !collection.mime_types.is_empty() && !collection.mime_types.contains(&mime_type) {
            return Err(BrokerError::constraint(format!(
                "Collection {} does not accept {}",
                collection.id, mime_type
            ))
            .into());
        }

        let now = Utc::now();
        let mime_type_id = self.mime_type_id(&mime_type)?;
        let id = QueryBuilder::insert("items")
            .value("rev", 0)
            .value("remote_id", item.remote_id.clone())
            .value("remote_revision", item.remote_revision.clone())
            .value("gid", item.gid.clone())
            .value("collection_id", collection.id.0)
            .value("mime_type_id", mime_type_id)
            .value("mtime", now.timestamp_millis())
            .value("atime", now.timestamp_millis())
            .value("dirty", item.dirty)
            .value("size", 0)
            .insert_id(self.conn())?;
        let id = ItemId(id);

        self.write_flags(id, &item.flags, &BTreeSet::new())?;
        self.write_tags(id, &item.tags, &BTreeSet::new())?;
        for part in parts {
            self.write_part(id, part)?;
        }
        self.refresh_size(id)?;

        *item = self.require_item(id)?;
        self.collector.item_added(item, &collection.resource);
        Ok(())
    }

    /// Append, or update the item with the same remote id in the same
    /// collection. Returns true when a new item was created.
    pub fn merge_item(&mut self, item: &mut Item, parts: &[Part]) -> Result<bool> {
        let existing = match &item.remote_id {
            Some(remote_id) => self.item_by_remote_id(item.collection_id, remote_id)?,
            None => None,
        };
        let Some(existing) = existing else {
            self.append_item(item, parts)?;
            return Ok(true);
        };

        let changes = ItemChanges {
            flags: Some(item.flags.clone()),
            tags: Some(item.tags.clone()),
            remote_revision: item.remote_revision.clone(),
            gid: item.gid.clone(),
            parts: parts.to_vec(),
            ..Default::default()
        };
        *item = self.update_item(existing.id, None, &changes)?;
        Ok(false)
    }

    /// Apply `changes` to one item. With `expected_revision`, the write only
    /// succeeds if the stored revision still matches.
    pub fn update_item(
        &mut self,
        id: ItemId,
        expected_revision: Option<i64>,
        changes: &ItemChanges,
    ) -> Result<Item> {
        let current = self.require_item(id)?;
        if let Some(expected) = expected_revision {
            if expected != current.revision {
                return Err(BrokerError::conflict(format!(
                    "Item {} is at revision {}, not {}",
                    id, current.revision, expected
                ))
                .into());
            }
        }

        let (added_flags, removed_flags) = diff_sets(
            &current.flags,
            changes.flags.as_ref(),
            &changes.added_flags,
            &changes.removed_flags,
        );
        let (added_tags, removed_tags) = diff_sets(
            &current.tags,
            changes.tags.as_ref(),
            &changes.added_tags,
            &changes.removed_tags,
        );

        let mut changed_parts = BTreeSet::new();
        let mut update = QueryBuilder::update("items").where_value("id", Equals, id.0);
        let mut has_columns = false;
        if let Some(remote_id) = changes.remote_id.as_ref().filter(|r| current.remote_id.as_ref() != Some(*r)) {
            update = update.value("remote_id", remote_id.as_str());
            changed_parts.insert("REMOTEID".to_string());
            has_columns = true;
        }
        if let Some(revision) = changes
            .remote_revision
            .as_ref()
            .filter(|r| current.remote_revision.as_ref() != Some(*r))
        {
            update = update.value("remote_revision", revision.as_str());
            changed_parts.insert("REMOTEREVISION".to_string());
            has_columns = true;
        }
        if let Some(gid) = changes.gid.as_ref().filter(|g| current.gid.as_ref() != Some(*g)) {
            update = update.value("gid", gid.as_str());
            changed_parts.insert("GID".to_string());
            has_columns = true;
        }
        if let Some(dirty) = changes.dirty.filter(|d| *d != current.dirty) {
            update = update.value("dirty", dirty);
            has_columns = true;
        }
        for part in &changes.parts {
            changed_parts.insert(part.name.clone());
        }

        let touches_parts = !changes.parts.is_empty() || !changes.removed_parts.is_empty();
        let has_changes = has_columns
            || touches_parts
            || !added_flags.is_empty()
            || !removed_flags.is_empty()
            || !added_tags.is_empty()
            || !removed_tags.is_empty();
        if !has_changes {
            return Ok(current);
        }

        // The revision is claimed atomically; zero rows means another writer
        // got there first.
        let claimed = self.conn().execute(
            "UPDATE items SET rev = rev + 1, mtime = ?1 WHERE id = ?2 AND rev = ?3",
            params![Utc::now().timestamp_millis(), id.0, current.revision],
        )?;
        if claimed == 0 {
            return Err(BrokerError::conflict(format!("Item {} was modified concurrently", id)).into());
        }
        if has_columns {
            update.exec(self.conn())?;
        }

        self.write_flags(id, &added_flags, &removed_flags)?;
        self.write_tags(id, &added_tags, &removed_tags)?;
        for part in &changes.parts {
            self.write_part(id, part)?;
        }
        if !changes.removed_parts.is_empty() {
            let removed = self.delete_parts(id, &changes.removed_parts)?;
            if removed > 0 {
                changed_parts.extend(changes.removed_parts.iter().cloned());
            }
        }
        if touches_parts {
            self.refresh_size(id)?;
        }

        let updated = self.require_item(id)?;
        let resource = self.resource_of(updated.collection_id)?;
        let linked = self.virtual_collections_of(&[id])?;
        let items = std::slice::from_ref(&updated);

        if !changed_parts.is_empty() {
            self.collector
                .item_changed(&updated, &resource, changed_parts.clone());
        }
        if !added_flags.is_empty() || !removed_flags.is_empty() {
            self.collector.items_flags_changed(
                items,
                &resource,
                updated.collection_id,
                added_flags.clone(),
                removed_flags.clone(),
            );
        }
        if !added_tags.is_empty() || !removed_tags.is_empty() {
            self.collector.items_tags_changed(
                items,
                &resource,
                updated.collection_id,
                added_tags.clone(),
                removed_tags.clone(),
            );
        }

        for (virtual_collection, virtual_resource) in linked.keys() {
            if !changed_parts.is_empty() {
                self.collector.item_changed_in(
                    &updated,
                    virtual_resource,
                    *virtual_collection,
                    changed_parts.clone(),
                );
            }
            if !added_flags.is_empty() || !removed_flags.is_empty() {
                self.collector.items_flags_changed(
                    items,
                    virtual_resource,
                    *virtual_collection,
                    added_flags.clone(),
                    removed_flags.clone(),
                );
            }
            if !added_tags.is_empty() || !removed_tags.is_empty() {
                self.collector.items_tags_changed(
                    items,
                    virtual_resource,
                    *virtual_collection,
                    added_tags.clone(),
                    removed_tags.clone(),
                );
            }
        }
        Ok(updated)
    }

    /// Move items into a concrete collection. Items leaving their resource
    /// lose their remote id and become dirty for the destination.
    pub fn move_items(&mut self, ids: &[ItemId], destination: CollectionId) -> Result<Vec<Item>> {
        let target = self.require_collection(destination)?;
        if target.is_virtual {
            return Err(BrokerError::constraint(format!(
                "Cannot move items into virtual collection {}",
                destination
            ))
            .into());
        }
        let items = self.items(&ItemFilter::ids(ids.iter().copied()))?;
        if items.len() != ids.len() {
            return Err(BrokerError::constraint("Some of the items to move do not exist").into());
        }

        let now = Utc::now().timestamp_millis();
        let mut moved = Vec::with_capacity(items.len());
        for (source, group) in by_collection(items) {
            if source == destination {
                continue;
            }
            let source_resource = self.resource_of(source)?;
            let cross_resource = source_resource != target.resource;
            let mut update = QueryBuilder::update("items")
                .value("collection_id", destination.0)
                .value("mtime", now)
                .where_in("id", group.iter().map(|i| i.id.0));
            if cross_resource {
                update = update
                    .value("remote_id", SqlValue::Null)
                    .value("remote_revision", SqlValue::Null)
                    .value("dirty", true);
            }
            update.exec(self.conn())?;
            for item in &group {
                self.conn()
                    .execute("UPDATE items SET rev = rev + 1 WHERE id = ?1", [item.id.0])?;
            }

            self.collector
                .items_moved(&group, &source_resource, source, &target.resource, destination);
            for item in &group {
                moved.push(self.require_item(item.id)?);
            }
        }
        Ok(moved)
    }

    /// Copy items with flags, tags and parts into a concrete collection
    pub fn copy_items(&mut self, items: &[Item], destination: CollectionId) -> Result<Vec<Item>> {
        let mut copies = Vec::with_capacity(items.len());
        for source in items {
            let parts = self.parts_of(source.id, None)?;
            let mut copy = Item::new(destination, source.mime_type.clone());
            copy.flags = source.flags.clone();
            copy.tags = source.tags.clone();
            copy.gid = source.gid.clone();
            copy.dirty = true;
            self.append_item(&mut copy, &parts)?;
            copies.push(copy);
        }
        Ok(copies)
    }

    /// Delete items with their parts
    pub fn remove_items(&mut self, ids: &[ItemId]) -> Result<Vec<Item>> {
        let items = self.items(&ItemFilter::ids(ids.iter().copied()))?;
        if items.is_empty() {
            return Ok(items);
        }
        let item_ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let files = self.external_files(&item_ids)?;
        self.obsolete_files.extend(files);
        let linked = self.virtual_collections_of(&item_ids)?;

        QueryBuilder::delete("items")
            .where_in("id", item_ids.iter().map(|i| i.0))
            .exec(self.conn())?;

        for ((virtual_collection, virtual_resource), members) in linked {
            let unlinked: Vec<Item> = items
                .iter()
                .filter(|i| members.contains(&i.id))
                .cloned()
                .collect();
            self.collector
                .items_unlinked(&unlinked, &virtual_resource, virtual_collection);
        }
        for (collection, group) in by_collection(items.clone()) {
            let resource = self.resource_of(collection)?;
            self.collector.items_removed(&group, &resource, collection);
        }
        debug!("Removed {} items", items.len());
        Ok(items)
    }

    /// Record a full-payload access for the cache sweep
    pub fn touch_atime(&mut self, ids: &[ItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        QueryBuilder::update("items")
            .value("atime", Utc::now().timestamp_millis())
            .where_in("id", ids.iter().map(|i| i.0))
            .exec(self.conn())?;
        Ok(())
    }

    fn require_virtual(&self, collection: CollectionId) -> Result<Collection> {
        let collection = self.require_collection(collection)?;
        if !collection.is_virtual {
            return Err(BrokerError::constraint(format!(
                "Collection {} is not virtual",
                collection.id
            ))
            .into());
        }
        Ok(collection)
    }

    /// Add items to a virtual collection; returns the newly linked ones
    pub fn link_items(&mut self, collection: CollectionId, ids: &[ItemId]) -> Result<Vec<Item>> {
        let target = self.require_virtual(collection)?;
        let mut linked = Vec::new();
        for item in self.items(&ItemFilter::ids(ids.iter().copied()))? {
            let inserted = self.conn().execute(
                "INSERT OR IGNORE INTO virtual_links (collection_id, item_id) VALUES (?1, ?2)",
                params![collection.0, item.id.0],
            )?;
            if inserted > 0 {
                linked.push(item);
            }
        }
        if !linked.is_empty() {
            self.collector
                .items_linked(&linked, &target.resource, collection);
        }
        Ok(linked)
    }

    /// Remove items from a virtual collection; returns the ones unlinked
    pub fn unlink_items(&mut self, collection: CollectionId, ids: &[ItemId]) -> Result<Vec<Item>> {
        let target = self.require_virtual(collection)?;
        let mut unlinked = Vec::new();
        for item in self.items(&ItemFilter::ids(ids.iter().copied()))? {
            let removed = self.conn().execute(
                "DELETE FROM virtual_links WHERE collection_id = ?1 AND item_id = ?2",
                params![collection.0, item.id.0],
            )?;
            if removed > 0 {
                unlinked.push(item);
            }
        }
        if !unlinked.is_empty() {
            self.collector
                .items_unlinked(&unlinked, &target.resource, collection);
        }
        Ok(unlinked)
    }

    /// Item ids linked into a virtual collection
    pub fn linked_item_ids(&self, collection: CollectionId) -> Result<BTreeSet<ItemId>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT item_id FROM virtual_links WHERE collection_id = ?1",
        )?;
        let ids = stmt
            .query_map([collection.0], |row| row.get(0).map(ItemId))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    /// Virtual collections (with their resource) linking any of the items
    pub fn virtual_collections_of(
        &self,
        ids: &[ItemId],
    ) -> Result<BTreeMap<(CollectionId, String), BTreeSet<ItemId>>> {
        let rows = QueryBuilder::select("virtual_links")
            .columns(&["virtual_links.collection_id", "resources.name", "virtual_links.item_id"])
            .join(
                JoinType::Inner,
                "collections",
                Condition::and().column("collections.id", Equals, "virtual_links.collection_id"),
            )
            .join(
                JoinType::Inner,
                "resources",
                Condition::and().column("resources.id", Equals, "collections.resource_id"),
            )
            .where_in("virtual_links.item_id", ids.iter().map(|i| i.0))
            .query(self.conn(), |row| {
                Ok((
                    CollectionId(row.get(0)?),
                    row.get::<_, String>(1)?,
                    ItemId(row.get(2)?),
                ))
            })?;
        let mut linked: BTreeMap<(CollectionId, String), BTreeSet<ItemId>> = BTreeMap::new();
        for (collection, resource, item) in rows {
            linked.entry((collection, resource)).or_default().insert(item);
        }
        Ok(linked)
    }

    /// Cached payload in `collection` not accessed since `cutoff` and not
    /// pinned by `policy`. Dirty items keep their payload.
    pub fn expiry_candidates(
        &self,
        collection: CollectionId,
        cutoff: DateTime<Utc>,
        policy: &CachePolicy,
    ) -> Result<Vec<PurgeCandidate>> {
        let rows = QueryBuilder::select("parts")
            .columns(&["parts.item_id", "parts.name"])
            .join(
                JoinType::Inner,
                "items",
                Condition::and().column("items.id", Equals, "parts.item_id"),
            )
            .where_value("items.collection_id", Equals, collection.0)
            .where_value("items.atime", Less, cutoff.timestamp_millis())
            .where_value("items.dirty", Equals, false)
            .where_value("parts.data", IsNot, SqlValue::Null)
            .where_value("parts.name", Like, format!("{}%", parts::PAYLOAD_PREFIX))
            .order_by("parts.item_id", SortOrder::Ascending)
            .query(self.conn(), |row| {
                Ok((ItemId(row.get(0)?), row.get::<_, String>(1)?))
            })?;

        let mut candidates: Vec<PurgeCandidate> = Vec::new();
        for (item, name) in rows {
            if policy.keeps_part(&name) {
                continue;
            }
            match candidates.last_mut() {
                Some(last) if last.item == item => last.parts.push(name),
                _ => candidates.push(PurgeCandidate {
                    item,
                    parts: vec![name],
                }),
            }
        }
        Ok(candidates)
    }
}

/// Effective (added, removed) sets for a replace-or-patch change
fn diff_sets<T: Ord + Clone>(
    current: &BTreeSet<T>,
    replace: Option<&BTreeSet<T>>,
    add: &BTreeSet<T>,
    remove: &BTreeSet<T>,
) -> (BTreeSet<T>, BTreeSet<T>) {
    let mut target = replace.cloned().unwrap_or_else(|| current.clone());
    target.extend(add.iter().cloned());
    for value in remove {
        target.remove(value);
    }
    let added = target.difference(current).cloned().collect();
    let removed = current.difference(&target).cloned().collect();
    (added, removed)
}
