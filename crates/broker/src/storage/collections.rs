//! Collection tree operations

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::Transaction;
use super::items::{ItemFilter, by_collection};
use super::query::{CompareOperator, Condition, JoinType, QueryBuilder, SortOrder, SqlValue};
use crate::error::BrokerError;
use crate::models::{
    CachePolicy, Collection, CollectionChanges, CollectionId, CollectionStatistics, Item, ItemId,
    SearchSpec, flags,
};
use crate::protocol::Depth;

use CompareOperator::*;

/// Resource owning persistent-search collections
pub const SEARCH_RESOURCE: &str = "search";

/// Name of the search resource's root collection
const SEARCH_ROOT_NAME: &str = "Search";

const COLLECTION_COLUMNS: &[&str] = &[
    "collections.id",
    "collections.parent_id",
    "resources.name",
    "collections.name",
    "collections.remote_id",
    "collections.remote_revision",
    "collections.subscribed",
    "collections.is_virtual",
    "collections.cache_inherit",
    "collections.cache_check_interval",
    "collections.cache_timeout",
    "collections.cache_sync_on_demand",
    "collections.cache_local_parts",
    "collections.revision",
    "collections.search_spec",
];

/// Restricts tree listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionFilter {
    pub resource: Option<String>,
    /// Keep collections offering any of these content types
    pub mime_types: BTreeSet<String>,
}

impl CollectionFilter {
    fn accepts(&self, collection: &Collection) -> bool {
        if let Some(resource) = &self.resource {
            if &collection.resource != resource {
                return false;
            }
        }
        self.mime_types.is_empty()
            || collection
                .mime_types
                .iter()
                .any(|m| self.mime_types.contains(m))
    }
}

fn base_query() -> QueryBuilder {
    QueryBuilder::select("collections")
        .columns(COLLECTION_COLUMNS)
        .join(
            JoinType::Inner,
            "resources",
            Condition::and().column("resources.id", Equals, "collections.resource_id"),
        )
        .order_by("collections.id", SortOrder::Ascending)
}

/// Collection row plus its raw search spec
fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<(Collection, Option<String>)> {
    let local_parts: String = row.get(12)?;
    let collection = Collection {
        id: CollectionId(row.get(0)?),
        parent_id: row.get::<_, Option<i64>>(1)?.map(CollectionId),
        resource: row.get(2)?,
        name: row.get(3)?,
        remote_id: row.get(4)?,
        remote_revision: row.get(5)?,
        mime_types: Vec::new(),
        cache_policy: CachePolicy {
            inherit: row.get(8)?,
            check_interval: row.get(9)?,
            cache_timeout: row.get(10)?,
            sync_on_demand: row.get(11)?,
            local_parts: local_parts.split_whitespace().map(String::from).collect(),
        },
        subscribed: row.get(6)?,
        is_virtual: row.get(7)?,
        attributes: BTreeMap::new(),
        revision: row.get(13)?,
        search: None,
    };
    Ok((collection, row.get(14)?))
}

fn local_parts_column(policy: &CachePolicy) -> String {
    policy.local_parts.join(" ")
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::constraint("Collection name must not be empty").into());
    }
    if name.contains('/') {
        return Err(BrokerError::constraint(format!(
            "Collection name {:?} must not contain '/'",
            name
        ))
        .into());
    }
    Ok(())
}

impl Transaction<'_> {
    fn load_collections(&self, query: QueryBuilder) -> Result<Vec<Collection>> {
        let rows = query.query(self.conn(), collection_from_row)?;
        let mut collections = Vec::with_capacity(rows.len());
        for (mut collection, search) in rows {
            if let Some(spec) = search {
                collection.search = Some(
                    serde_json::from_str::<SearchSpec>(&spec)
                        .with_context(|| format!("Corrupt search spec on {}", collection.id))?,
                );
            }
            self.fill_collection_details(&mut collection)?;
            collections.push(collection);
        }
        Ok(collections)
    }

    fn fill_collection_details(&self, collection: &mut Collection) -> Result<()> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT mime_types.name FROM collection_mime_types
             JOIN mime_types ON mime_types.id = collection_mime_types.mime_type_id
             WHERE collection_mime_types.collection_id = ?1 ORDER BY mime_types.name",
        )?;
        collection.mime_types = stmt
            .query_map([collection.id.0], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut stmt = self.conn().prepare_cached(
            "SELECT name, value FROM collection_attributes WHERE collection_id = ?1",
        )?;
        collection.attributes = stmt
            .query_map([collection.id.0], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<String, Vec<u8>>, _>>()?;
        Ok(())
    }

    pub fn collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        let query = base_query().where_value("collections.id", Equals, id.0);
        Ok(self.load_collections(query)?.into_iter().next())
    }

    pub fn require_collection(&self, id: CollectionId) -> Result<Collection> {
        self.collection(id)?
            .ok_or_else(|| BrokerError::not_found("Collection", id).into())
    }

    /// Every collection, ordered by id
    pub fn all_collections(&self) -> Result<Vec<Collection>> {
        self.load_collections(base_query())
    }

    pub fn resource_root(&self, resource: &str) -> Result<Option<Collection>> {
        let query = base_query()
            .where_value("resources.name", Equals, resource)
            .where_value("collections.parent_id", Is, SqlValue::Null);
        Ok(self.load_collections(query)?.into_iter().next())
    }

    /// Direct children; `None` lists resource roots
    pub fn children(&self, parent: Option<CollectionId>) -> Result<Vec<Collection>> {
        let query = base_query().where_value(
            "collections.parent_id",
            Equals,
            SqlValue::from(parent.map(|p| p.0)),
        );
        self.load_collections(query)
    }

    /// Look up by remote id inside a resource, optionally below one parent
    pub fn collection_by_remote_id(
        &self,
        resource: &str,
        remote_id: &str,
        parent: Option<CollectionId>,
    ) -> Result<Option<Collection>> {
        let mut query = base_query()
            .where_value("resources.name", Equals, resource)
            .where_value("collections.remote_id", Equals, remote_id);
        if let Some(parent) = parent {
            query = query.where_value("collections.parent_id", Equals, parent.0);
        }
        let mut found = self.load_collections(query)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(BrokerError::constraint(format!(
                "Remote id {} is ambiguous in resource {}",
                remote_id, resource
            ))
            .into()),
        }
    }

    /// Resolve a leaf-first remote id chain from the resource root down
    pub fn collection_by_hrid(&self, resource: &str, chain: &[String]) -> Result<Option<Collection>> {
        let mut current: Option<Collection> = None;
        for remote_id in chain.iter().rev() {
            let next = match &current {
                None => self.resource_root(resource)?.filter(|root| {
                    remote_id.is_empty() || root.remote_id.as_deref() == Some(remote_id)
                }),
                Some(parent) => self
                    .children(Some(parent.id))?
                    .into_iter()
                    .find(|c| c.remote_id.as_deref() == Some(remote_id)),
            };
            match next {
                Some(collection) => current = Some(collection),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Resolve a `/`-separated name path, starting at a root
    pub fn collection_by_path(&self, resource: Option<&str>, path: &str) -> Result<Option<Collection>> {
        let mut current: Option<Collection> = None;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            let parent = current.as_ref().map(|c| c.id);
            let next = self.children(parent)?.into_iter().find(|c| {
                c.name == name && (parent.is_some() || resource.is_none_or(|r| c.resource == r))
            });
            match next {
                Some(collection) => current = Some(collection),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Collections at most `depth` levels below `base`, breadth first.
    /// `base` itself is level 0; `None` is the virtual top whose children
    /// are the resource roots.
    pub fn subtree(
        &self,
        base: Option<CollectionId>,
        depth: Depth,
        filter: &CollectionFilter,
    ) -> Result<Vec<Collection>> {
        let mut result = Vec::new();
        if let Some(id) = base {
            let collection = self.require_collection(id)?;
            if filter.accepts(&collection) {
                result.push(collection);
            }
        }

        let mut frontier = vec![base];
        let mut level = 1;
        while depth.includes(level) && !frontier.is_empty() {
            let mut next = Vec::new();
            for parent in frontier {
                for child in self.children(parent)? {
                    next.push(Some(child.id));
                    if filter.accepts(&child) {
                        result.push(child);
                    }
                }
            }
            frontier = next;
            level += 1;
        }
        Ok(result)
    }

    /// `id` and every descendant, deepest first
    pub fn descendant_ids(&self, id: CollectionId) -> Result<Vec<CollectionId>> {
        let mut stmt = self.conn().prepare_cached(
            "WITH RECURSIVE tree(id, depth) AS (
                 SELECT ?1, 0
                 UNION ALL
                 SELECT collections.id, tree.depth + 1
                 FROM collections JOIN tree ON collections.parent_id = tree.id
             )
             SELECT id FROM tree ORDER BY depth DESC, id ASC",
        )?;
        let ids = stmt
            .query_map([id.0], |row| row.get(0).map(CollectionId))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Parents of `collection`, nearest first, limited to `depth` levels
    pub fn ancestors(&self, collection: &Collection, depth: Depth) -> Result<Vec<Collection>> {
        let mut chain = Vec::new();
        let mut parent = collection.parent_id;
        let mut level = 1;
        while let Some(id) = parent {
            if !depth.includes(level) {
                break;
            }
            let ancestor = self.require_collection(id)?;
            parent = ancestor.parent_id;
            chain.push(ancestor);
            level += 1;
        }
        Ok(chain)
    }

    /// Cache policy after resolving inheritance up the tree
    pub fn effective_cache_policy(&self, collection: &Collection) -> Result<CachePolicy> {
        if !collection.cache_policy.inherit {
            return Ok(collection.cache_policy.clone());
        }
        let mut parent = collection.parent_id;
        while let Some(id) = parent {
            let ancestor = self.require_collection(id)?;
            if !ancestor.cache_policy.inherit {
                return Ok(ancestor.cache_policy);
            }
            parent = ancestor.parent_id;
        }
        Ok(CachePolicy::system_default())
    }

    /// Effective policy of every concrete collection
    pub fn effective_cache_policies(&self) -> Result<Vec<(Collection, CachePolicy)>> {
        let collections = self.all_collections()?;
        let by_id: HashMap<CollectionId, &Collection> =
            collections.iter().map(|c| (c.id, c)).collect();

        let mut result = Vec::new();
        for collection in collections.iter().filter(|c| !c.is_virtual) {
            let mut current = collection;
            while current.cache_policy.inherit {
                match current.parent_id.and_then(|p| by_id.get(&p)) {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            let policy = if current.cache_policy.inherit {
                CachePolicy::system_default()
            } else {
                current.cache_policy.clone()
            };
            result.push((collection.clone(), policy));
        }
        Ok(result)
    }

    /// Item count, total size and unseen count
    pub fn collection_statistics(&self, collection: &Collection) -> Result<CollectionStatistics> {
        let seen_items = QueryBuilder::select("item_flags")
            .column("item_flags.item_id")
            .join(
                JoinType::Inner,
                "flags",
                Condition::and().column("flags.id", Equals, "item_flags.flag_id"),
            )
            .where_value("flags.name", Equals, flags::SEEN);

        let members = if collection.is_virtual {
            QueryBuilder::select("items").join(
                JoinType::Inner,
                "virtual_links",
                Condition::and()
                    .column("virtual_links.item_id", Equals, "items.id")
                    .value("virtual_links.collection_id", Equals, collection.id.0),
            )
        } else {
            QueryBuilder::select("items").where_value("items.collection_id", Equals, collection.id.0)
        };

        let (count, size) = members
            .clone()
            .columns(&["COUNT(*)", "COALESCE(SUM(items.size), 0)"])
            .query(self.conn(), |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .into_iter()
            .next()
            .unwrap_or((0, 0));
        let unseen = members
            .column("COUNT(*)")
            .where_condition(Condition::and().sub_query("items.id", NotIn, seen_items))
            .query(self.conn(), |row| row.get::<_, i64>(0))?
            .into_iter()
            .next()
            .unwrap_or(0);

        Ok(CollectionStatistics {
            count,
            size,
            unseen,
        })
    }

    fn sibling_name_taken(
        &self,
        parent: Option<CollectionId>,
        name: &str,
        except: Option<CollectionId>,
    ) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT id FROM collections
                 WHERE coalesce(parent_id, 0) = ?1 AND name = ?2 AND id <> ?3",
                params![parent.map_or(0, |p| p.0), name, except.map_or(0, |e| e.0)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn write_mime_types(&self, id: CollectionId, mime_types: &[String]) -> Result<()> {
        self.conn().execute(
            "DELETE FROM collection_mime_types WHERE collection_id = ?1",
            [id.0],
        )?;
        for mime_type in mime_types {
            let mime_id = self.mime_type_id(mime_type)?;
            self.conn().execute(
                "INSERT OR IGNORE INTO collection_mime_types (collection_id, mime_type_id) VALUES (?1, ?2)",
                params![id.0, mime_id],
            )?;
        }
        Ok(())
    }

    fn write_attribute(&self, id: CollectionId, name: &str, value: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO collection_attributes (collection_id, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection_id, name) DO UPDATE SET value = excluded.value",
            params![id.0, name, value],
        )?;
        Ok(())
    }

    fn bump_collection_revision(&self, id: CollectionId) -> Result<()> {
        self.conn().execute(
            "UPDATE collections SET revision = revision + 1 WHERE id = ?1",
            [id.0],
        )?;
        Ok(())
    }

    /// Insert a new collection; fills in `id` and `resource`
    pub fn append_collection(&mut self, collection: &mut Collection) -> Result<()> {
        validate_name(&collection.name)?;

        match collection.parent_id {
            None => {
                if collection.resource.is_empty() {
                    return Err(BrokerError::constraint(
                        "A top-level collection needs a resource",
                    )
                    .into());
                }
                if self.resource_root(&collection.resource)?.is_some() {
                    return Err(BrokerError::constraint(format!(
                        "Resource {} already has a root collection",
                        collection.resource
                    ))
                    .into());
                }
            }
            Some(parent_id) => {
                let parent = self.require_collection(parent_id)?;
                if !collection.resource.is_empty() && collection.resource != parent.resource {
                    return Err(BrokerError::constraint(format!(
                        "Collection of resource {} cannot be created below {} of resource {}",
                        collection.resource, parent.id, parent.resource
                    ))
                    .into());
                }
                if parent.is_virtual && !collection.is_virtual {
                    return Err(BrokerError::constraint(
                        "Only virtual collections can be created below a virtual collection",
                    )
                    .into());
                }
                collection.resource = parent.resource;
            }
        }

        if self.sibling_name_taken(collection.parent_id, &collection.name, None)? {
            return Err(BrokerError::constraint(format!(
                "A collection named {:?} already exists there",
                collection.name
            ))
            .into());
        }

        let resource_id = self.resource_id(&collection.resource)?;
        let search = collection
            .search
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let policy = &collection.cache_policy;
        let id = QueryBuilder::insert("collections")
            .value("parent_id", collection.parent_id.map(|p| p.0))
            .value("resource_id", resource_id)
            .value("name", collection.name.as_str())
            .value("remote_id", collection.remote_id.clone())
            .value("remote_revision", collection.remote_revision.clone())
            .value("subscribed", collection.subscribed)
            .value("is_virtual", collection.is_virtual)
            .value("cache_inherit", policy.inherit)
            .value("cache_check_interval", policy.check_interval as i64)
            .value("cache_timeout", policy.cache_timeout as i64)
            .value("cache_sync_on_demand", policy.sync_on_demand)
            .value("cache_local_parts", local_parts_column(policy))
            .value("search_spec", search)
            .insert_id(self.conn())?;
        collection.id = CollectionId(id);
        collection.revision = 0;

        self.write_mime_types(collection.id, &collection.mime_types)?;
        for (name, value) in &collection.attributes {
            self.write_attribute(collection.id, name, value)?;
        }

        self.collector.collection_added(collection);
        Ok(())
    }

    /// Apply property changes; one coalesced Modify event
    pub fn update_collection(&mut self, id: CollectionId, changes: &CollectionChanges) -> Result<Collection> {
        let mut current = self.require_collection(id)?;
        let mut pending = changes.clone();
        if let Some(parent) = pending.parent.take() {
            if current.parent_id != Some(parent) {
                // The new name is checked against the destination, not the old siblings
                let name = pending.name.take().filter(|n| *n != current.name);
                if let Some(name) = &name {
                    validate_name(name)?;
                }
                current = self.relocate(id, parent, name.as_deref())?;
                if let Some(name) = name {
                    if pending.is_empty() {
                        let renamed = CollectionChanges {
                            name: Some(name),
                            ..Default::default()
                        };
                        self.collector.collection_changed(&current, renamed.changed_parts());
                        return Ok(current);
                    }
                    pending.name = Some(name);
                }
            }
        }
        if pending.is_empty() {
            return Ok(current);
        }
        let changes = &pending;

        let mut update = QueryBuilder::update("collections").where_value("id", Equals, id.0);
        let mut has_columns = false;
        if let Some(name) = &changes.name {
            validate_name(name)?;
            if *name != current.name && self.sibling_name_taken(current.parent_id, name, Some(id))? {
                return Err(BrokerError::constraint(format!(
                    "A collection named {:?} already exists there",
                    name
                ))
                .into());
            }
            update = update.value("name", name.as_str());
            has_columns = true;
        }
        if let Some(remote_id) = &changes.remote_id {
            update = update.value("remote_id", SqlValue::from((!remote_id.is_empty()).then(|| remote_id.clone())));
            has_columns = true;
        }
        if let Some(remote_revision) = &changes.remote_revision {
            update = update.value("remote_revision", remote_revision.as_str());
            has_columns = true;
        }
        if let Some(policy) = &changes.cache_policy {
            update = update
                .value("cache_inherit", policy.inherit)
                .value("cache_check_interval", policy.check_interval as i64)
                .value("cache_timeout", policy.cache_timeout as i64)
                .value("cache_sync_on_demand", policy.sync_on_demand)
                .value("cache_local_parts", local_parts_column(policy));
            has_columns = true;
        }
        if has_columns {
            update.exec(self.conn())?;
        }

        if let Some(mime_types) = &changes.mime_types {
            self.write_mime_types(id, mime_types)?;
        }
        for (name, value) in &changes.attributes {
            self.write_attribute(id, name, value)?;
        }
        for name in &changes.removed_attributes {
            self.conn().execute(
                "DELETE FROM collection_attributes WHERE collection_id = ?1 AND name = ?2",
                params![id.0, name],
            )?;
        }
        self.bump_collection_revision(id)?;

        let updated = self.require_collection(id)?;
        self.collector.collection_changed(&updated, changes.changed_parts());
        Ok(updated)
    }

    /// Change the stored search definition of a virtual collection
    pub fn set_search_spec(&mut self, id: CollectionId, spec: &SearchSpec) -> Result<()> {
        let json = serde_json::to_string(spec)?;
        self.conn().execute(
            "UPDATE collections SET search_spec = ?1 WHERE id = ?2 AND is_virtual = 1",
            params![json, id.0],
        )?;
        Ok(())
    }

    /// Re-parent a collection, possibly into another resource
    pub fn move_collection(&mut self, id: CollectionId, new_parent: CollectionId) -> Result<Collection> {
        self.relocate(id, new_parent, None)
    }

    /// Rename, optionally moving to a new parent in the same step
    pub fn rename_collection(
        &mut self,
        id: CollectionId,
        name: &str,
        new_parent: Option<CollectionId>,
    ) -> Result<Collection> {
        let changes = CollectionChanges {
            name: Some(name.to_string()),
            parent: new_parent,
            ..Default::default()
        };
        self.update_collection(id, &changes)
    }

    /// Set parent and, when given, name in one update. The name that ends
    /// up in the destination is the one checked for clashes.
    fn relocate(&mut self, id: CollectionId, new_parent: CollectionId, name: Option<&str>) -> Result<Collection> {
        let current = self.require_collection(id)?;
        let Some(old_parent) = current.parent_id else {
            return Err(BrokerError::constraint("Cannot move a resource root").into());
        };
        let target_name = name.unwrap_or(&current.name);
        if old_parent == new_parent && target_name == current.name {
            return Ok(current);
        }
        if self.descendant_ids(id)?.contains(&new_parent) {
            return Err(BrokerError::constraint(format!(
                "Cannot move collection {} into its own subtree",
                id
            ))
            .into());
        }
        let destination = self.require_collection(new_parent)?;
        if destination.is_virtual != current.is_virtual {
            return Err(BrokerError::constraint(
                "Cannot move collections between virtual and concrete trees",
            )
            .into());
        }
        if self.sibling_name_taken(Some(new_parent), target_name, Some(id))? {
            return Err(BrokerError::constraint(format!(
                "A collection named {:?} already exists in {}",
                target_name, new_parent
            ))
            .into());
        }

        self.conn().execute(
            "UPDATE collections SET parent_id = ?1, name = ?2, revision = revision + 1 WHERE id = ?3",
            params![new_parent.0, target_name, id.0],
        )?;
        if destination.resource != current.resource {
            let resource_id = self.resource_id(&destination.resource)?;
            let subtree: Vec<i64> = self.descendant_ids(id)?.into_iter().map(|c| c.0).collect();
            QueryBuilder::update("collections")
                .value("resource_id", resource_id)
                .where_in("id", subtree)
                .exec(self.conn())?;
        }

        let moved = self.require_collection(id)?;
        self.collector
            .collection_moved(&moved, &current.resource, current.parent_id);
        Ok(moved)
    }

    pub fn set_subscribed(&mut self, id: CollectionId, subscribed: bool) -> Result<bool> {
        let current = self.require_collection(id)?;
        if current.subscribed == subscribed {
            return Ok(false);
        }
        self.conn().execute(
            "UPDATE collections SET subscribed = ?1, revision = revision + 1 WHERE id = ?2",
            params![subscribed, id.0],
        )?;
        let updated = self.require_collection(id)?;
        self.collector
            .collection_subscription_changed(&updated, subscribed);
        Ok(true)
    }

    /// Delete a collection with its subtree, items and parts; returns the
    /// removed collections, deepest first. Owned items are announced as
    /// removed, and unlinked from virtual collections outside the subtree.
    pub fn remove_collection(&mut self, id: CollectionId) -> Result<Vec<Collection>> {
        self.require_collection(id)?;
        let ids = self.descendant_ids(id)?;
        let mut removed = Vec::with_capacity(ids.len());
        for collection_id in &ids {
            removed.push(self.require_collection(*collection_id)?);
        }

        let items = self.items(&ItemFilter {
            collections: Some(ids.clone()),
            ..Default::default()
        })?;
        let item_ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let linked = if item_ids.is_empty() {
            BTreeMap::new()
        } else {
            let files = self.external_files(&item_ids)?;
            self.obsolete_files.extend(files);
            self.virtual_collections_of(&item_ids)?
        };

        self.conn()
            .execute("DELETE FROM collections WHERE id = ?1", [id.0])?;

        for ((virtual_collection, virtual_resource), members) in linked {
            if ids.contains(&virtual_collection) {
                continue;
            }
            let unlinked: Vec<Item> = items
                .iter()
                .filter(|i| members.contains(&i.id))
                .cloned()
                .collect();
            self.collector
                .items_unlinked(&unlinked, &virtual_resource, virtual_collection);
        }
        for (collection, group) in by_collection(items) {
            if let Some(owner) = removed.iter().find(|c| c.id == collection) {
                self.collector.items_removed(&group, &owner.resource, collection);
            }
        }
        for collection in &removed {
            self.collector.collection_removed(collection);
        }
        Ok(removed)
    }

    /// Copy a collection subtree with its items below `new_parent`
    pub fn copy_collection(&mut self, id: CollectionId, new_parent: CollectionId) -> Result<Collection> {
        let source = self.require_collection(id)?;
        if self.descendant_ids(id)?.contains(&new_parent) {
            return Err(BrokerError::constraint(format!(
                "Cannot copy collection {} into its own subtree",
                id
            ))
            .into());
        }
        self.copy_collection_into(&source, new_parent)
    }

    fn copy_collection_into(&mut self, source: &Collection, new_parent: CollectionId) -> Result<Collection> {
        let mut copy = source.clone();
        copy.id = CollectionId(0);
        copy.parent_id = Some(new_parent);
        copy.resource = String::new();
        copy.remote_id = None;
        copy.remote_revision = None;
        self.append_collection(&mut copy)?;

        if !source.is_virtual {
            let items = self.items_in_collection(source.id)?;
            if !items.is_empty() {
                self.copy_items(&items, copy.id)?;
            }
        }
        for child in self.children(Some(source.id))? {
            self.copy_collection_into(&child, copy.id)?;
        }
        Ok(copy)
    }

    /// Root of the persistent-search tree, created on first use
    pub fn search_root(&mut self) -> Result<Collection> {
        if let Some(root) = self.resource_root(SEARCH_RESOURCE)? {
            return Ok(root);
        }
        self.conn().execute(
            "INSERT OR IGNORE INTO resources (name, is_virtual) VALUES (?1, 1)",
            [SEARCH_RESOURCE],
        )?;
        let mut root = Collection::new(SEARCH_ROOT_NAME, None);
        root.resource = SEARCH_RESOURCE.to_string();
        root.is_virtual = true;
        root.cache_policy = CachePolicy::system_default();
        self.append_collection(&mut root)?;
        Ok(root)
    }

    /// Persistent-search collections
    pub fn search_collections(&self) -> Result<Vec<Collection>> {
        let query = base_query()
            .where_value("collections.is_virtual", Equals, true)
            .where_value("collections.search_spec", IsNot, SqlValue::Null);
        self.load_collections(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::notify::{CollectionOperation, MonitorFilter};
    use crate::storage::Store;
    use tempfile::{TempDir, tempdir};

    fn store() -> (TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), &StorageConfig::default()).unwrap();
        (dir, store)
    }

    fn create(tx: &mut Transaction<'_>, name: &str, parent: Option<CollectionId>, resource: &str) -> Collection {
        let mut col = Collection::new(name, parent);
        col.resource = resource.to_string();
        tx.append_collection(&mut col).unwrap();
        col
    }

    #[test]
    fn test_append_and_fetch() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "imap", None, "imap");
        let mut inbox = Collection::new("Inbox", Some(root.id))
            .with_remote_id("INBOX")
            .with_mime_types(vec!["message/rfc822".into()]);
        inbox.attributes.insert("color".into(), b"red".to_vec());
        tx.append_collection(&mut inbox).unwrap();
        tx.commit().unwrap();

        let tx = store.begin_read("test").unwrap();
        let fetched = tx.require_collection(inbox.id).unwrap();
        assert_eq!(fetched.name, "Inbox");
        assert_eq!(fetched.resource, "imap");
        assert_eq!(fetched.mime_types, vec!["message/rfc822".to_string()]);
        assert_eq!(fetched.attributes.get("color").unwrap(), b"red");
        assert_eq!(fetched.cache_policy, CachePolicy::default());
    }

    #[test]
    fn test_sibling_names_are_unique() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "imap", None, "imap");
        create(&mut tx, "Inbox", Some(root.id), "");
        let mut dup = Collection::new("Inbox", Some(root.id));
        let err = tx.append_collection(&mut dup).unwrap_err();
        assert_eq!(
            crate::error::ErrorKind::classify(&err),
            crate::error::ErrorKind::Constraint
        );
    }

    #[test]
    fn test_one_root_per_resource() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        create(&mut tx, "imap", None, "imap");
        let mut second = Collection::new("other", None);
        second.resource = "imap".into();
        assert!(tx.append_collection(&mut second).is_err());
    }

    #[test]
    fn test_lookup_by_remote_id_hrid_and_path() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "imap", None, "imap");
        let mut inbox = Collection::new("Inbox", Some(root.id)).with_remote_id("INBOX");
        tx.append_collection(&mut inbox).unwrap();
        let mut sub = Collection::new("Lists", Some(inbox.id)).with_remote_id("INBOX.Lists");
        tx.append_collection(&mut sub).unwrap();

        let by_rid = tx.collection_by_remote_id("imap", "INBOX.Lists", None).unwrap().unwrap();
        assert_eq!(by_rid.id, sub.id);
        let by_hrid = tx
            .collection_by_hrid("imap", &["INBOX.Lists".into(), "INBOX".into(), "".into()])
            .unwrap()
            .unwrap();
        assert_eq!(by_hrid.id, sub.id);
        let by_path = tx.collection_by_path(None, "imap/Inbox/Lists").unwrap().unwrap();
        assert_eq!(by_path.id, sub.id);
        assert!(tx.collection_by_path(None, "imap/Outbox").unwrap().is_none());
    }

    #[test]
    fn test_subtree_depths() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "imap", None, "imap");
        let a = create(&mut tx, "a", Some(root.id), "");
        create(&mut tx, "c", Some(a.id), "");

        let filter = CollectionFilter::default();
        assert_eq!(tx.subtree(Some(root.id), Depth::Base, &filter).unwrap().len(), 1);
        assert_eq!(tx.subtree(Some(root.id), Depth::Levels(1), &filter).unwrap().len(), 2);
        assert_eq!(tx.subtree(Some(root.id), Depth::Infinite, &filter).unwrap().len(), 3);
        let roots = tx.subtree(None, Depth::Levels(1), &filter).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, root.id);
    }

    #[test]
    fn test_rename_moves_subtree_path() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "local", None, "local");
        let a = create(&mut tx, "a", Some(root.id), "");
        create(&mut tx, "c", Some(a.id), "");
        tx.rename_collection(a.id, "b", None).unwrap();

        assert!(tx.collection_by_path(None, "local/b/c").unwrap().is_some());
        assert!(tx.collection_by_path(None, "local/a/c").unwrap().is_none());
    }

    #[test]
    fn test_move_rejects_cycles() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "local", None, "local");
        let a = create(&mut tx, "a", Some(root.id), "");
        let b = create(&mut tx, "b", Some(a.id), "");
        assert!(tx.move_collection(a.id, b.id).is_err());

        let other = create(&mut tx, "other", Some(root.id), "");
        let moved = tx.move_collection(b.id, other.id).unwrap();
        assert_eq!(moved.parent_id, Some(other.id));
        assert_eq!(moved.revision, 1);
    }

    #[test]
    fn test_cross_resource_move_updates_subtree() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let imap = create(&mut tx, "imap", None, "imap");
        let local = create(&mut tx, "local", None, "local");
        let a = create(&mut tx, "a", Some(imap.id), "");
        let c = create(&mut tx, "c", Some(a.id), "");
        tx.move_collection(a.id, local.id).unwrap();
        assert_eq!(tx.require_collection(c.id).unwrap().resource, "local");
    }

    #[test]
    fn test_effective_cache_policy_inherits() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let mut root = Collection::new("imap", None).with_cache_policy(CachePolicy {
            inherit: false,
            check_interval: 10,
            cache_timeout: 30,
            sync_on_demand: true,
            local_parts: vec!["PLD:HEAD".into()],
        });
        root.resource = "imap".into();
        tx.append_collection(&mut root).unwrap();
        let child = create(&mut tx, "Inbox", Some(root.id), "");

        let policy = tx.effective_cache_policy(&child).unwrap();
        assert_eq!(policy.check_interval, 10);
        assert!(!policy.inherit);

        let orphan = create(&mut tx, "local", None, "local");
        assert_eq!(
            tx.effective_cache_policy(&orphan).unwrap(),
            CachePolicy::system_default()
        );
        let all = tx.effective_cache_policies().unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_modify_notifies_once_after_commit() {
        let (_dir, store) = store();
        let mut monitor = store
            .bus()
            .monitor(MonitorFilter::kinds([crate::notify::EntityKind::Collections]))
            .unwrap();

        let mut tx = store.begin("test").unwrap();
        let root = create(&mut tx, "imap", None, "imap");
        let mut changes = CollectionChanges {
            name: Some("IMAP".into()),
            ..Default::default()
        };
        tx.update_collection(root.id, &changes).unwrap();
        changes.name = None;
        changes.attributes.insert("color".into(), b"blue".to_vec());
        tx.update_collection(root.id, &changes).unwrap();
        assert!(monitor.try_recv().is_none());
        tx.commit().unwrap();

        let added = monitor.try_recv().unwrap();
        assert_eq!(added.collection().unwrap().operation, CollectionOperation::Add);
        let modified = monitor.try_recv().unwrap();
        let change = modified.collection().unwrap();
        assert_eq!(change.operation, CollectionOperation::Modify);
        assert!(change.changed.contains("NAME") && change.changed.contains("color"));
        assert!(monitor.try_recv().is_none());
    }

    #[test]
    fn test_rollback_discards_everything() {
        let (_dir, store) = store();
        let mut monitor = store.bus().monitor(MonitorFilter::all()).unwrap();
        {
            let mut tx = store.begin("test").unwrap();
            create(&mut tx, "imap", None, "imap");
        }
        assert!(monitor.try_recv().is_none());
        let tx = store.begin_read("test").unwrap();
        assert!(tx.resource_root("imap").unwrap().is_none());
    }

    #[test]
    fn test_search_root_is_virtual_and_reused() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let root = tx.search_root().unwrap();
        assert!(root.is_virtual);
        assert_eq!(tx.search_root().unwrap().id, root.id);
    }
}
