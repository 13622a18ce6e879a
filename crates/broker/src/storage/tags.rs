//! Tag operations
//!
//! Tags are global and addressed by gid. Remote ids are kept per resource;
//! reads report the remote id of the resource passed in, if any.

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::lookup::{self, Lookup};
use super::query::{CompareOperator, Condition, QueryBuilder, SortOrder};
use super::Transaction;
use crate::error::BrokerError;
use crate::models::{ItemId, Tag, TagChanges, TagId};

use CompareOperator::*;

impl Transaction<'_> {
    fn load_tags(&self, query: QueryBuilder, resource: Option<&str>) -> Result<Vec<Tag>> {
        let rows = query
            .columns(&["tags.id", "tags.gid", "tags.parent_id", "tag_types.name"])
            .join(
                super::query::JoinType::Inner,
                "tag_types",
                Condition::and().column("tag_types.id", Equals, "tags.type_id"),
            )
            .order_by("tags.id", SortOrder::Ascending)
            .query(self.conn(), |row| {
                Ok(Tag {
                    id: TagId(row.get(0)?),
                    gid: row.get(1)?,
                    parent_id: row.get::<_, Option<i64>>(2)?.map(TagId),
                    tag_type: row.get(3)?,
                    remote_id: None,
                    attributes: BTreeMap::new(),
                })
            })?;

        let resource_id = match resource {
            Some(name) => self.find_resource_id(name)?,
            None => None,
        };
        let mut tags = rows;
        for tag in &mut tags {
            let mut stmt = self
                .conn()
                .prepare_cached("SELECT name, value FROM tag_attributes WHERE tag_id = ?1")?;
            tag.attributes = stmt
                .query_map([tag.id.0], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<BTreeMap<String, Vec<u8>>, _>>()?;
            if let Some(resource_id) = resource_id {
                tag.remote_id = self
                    .conn()
                    .query_row(
                        "SELECT remote_id FROM tag_remote_ids WHERE tag_id = ?1 AND resource_id = ?2",
                        params![tag.id.0, resource_id],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?
                    .flatten();
            }
        }
        Ok(tags)
    }

    pub fn tag(&self, id: TagId, resource: Option<&str>) -> Result<Option<Tag>> {
        let query = QueryBuilder::select("tags").where_value("tags.id", Equals, id.0);
        Ok(self.load_tags(query, resource)?.into_iter().next())
    }

    pub fn require_tag(&self, id: TagId) -> Result<Tag> {
        self.tag(id, None)?
            .ok_or_else(|| BrokerError::not_found("Tag", id).into())
    }

    pub fn tag_by_gid(&self, gid: &str, resource: Option<&str>) -> Result<Option<Tag>> {
        let query = QueryBuilder::select("tags").where_value("tags.gid", Equals, gid);
        Ok(self.load_tags(query, resource)?.into_iter().next())
    }

    /// Tags within the id ranges; no ranges means every tag
    pub fn tags(&self, ranges: &[(i64, Option<i64>)], resource: Option<&str>) -> Result<Vec<Tag>> {
        let mut query = QueryBuilder::select("tags");
        if !ranges.is_empty() {
            let mut any = Condition::or();
            for (lo, hi) in ranges {
                let mut range = Condition::and().value("tags.id", GreaterOrEqual, *lo);
                if let Some(hi) = hi {
                    range = range.value("tags.id", LessOrEqual, *hi);
                }
                any = any.nested(range);
            }
            query = query.where_condition(any);
        }
        self.load_tags(query, resource)
    }

    /// Items carrying a tag
    pub fn tagged_items(&self, id: TagId) -> Result<Vec<ItemId>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT item_id FROM item_tags WHERE tag_id = ?1 ORDER BY item_id")?;
        let ids = stmt
            .query_map([id.0], |row| row.get(0).map(ItemId))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn set_tag_remote_id(&self, id: TagId, resource: &str, remote_id: &str) -> Result<()> {
        let resource_id = self.resource_id(resource)?;
        if remote_id.is_empty() {
            self.conn().execute(
                "DELETE FROM tag_remote_ids WHERE tag_id = ?1 AND resource_id = ?2",
                params![id.0, resource_id],
            )?;
        } else {
            self.conn().execute(
                "INSERT INTO tag_remote_ids (tag_id, resource_id, remote_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tag_id, resource_id) DO UPDATE SET remote_id = excluded.remote_id",
                params![id.0, resource_id, remote_id],
            )?;
        }
        Ok(())
    }

    fn write_tag_attributes(&self, id: TagId, changes: &TagChanges) -> Result<()> {
        for (name, value) in &changes.attributes {
            self.conn().execute(
                "INSERT INTO tag_attributes (tag_id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tag_id, name) DO UPDATE SET value = excluded.value",
                params![id.0, name, value],
            )?;
        }
        for name in &changes.removed_attributes {
            self.conn().execute(
                "DELETE FROM tag_attributes WHERE tag_id = ?1 AND name = ?2",
                params![id.0, name],
            )?;
        }
        Ok(())
    }

    /// Create a tag, or return the existing one with the same gid. A remote
    /// id is recorded for `resource` either way. Returns true when created.
    pub fn append_tag(&mut self, changes: &TagChanges, resource: Option<&str>) -> Result<(Tag, bool)> {
        let gid = changes
            .gid
            .as_deref()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| BrokerError::syntax("TAGAPPEND needs a GID"))?;

        if let Some(existing) = self.tag_by_gid(gid, resource)? {
            if let (Some(resource), Some(remote_id)) = (resource, &changes.remote_id) {
                self.set_tag_remote_id(existing.id, resource, remote_id)?;
            }
            let tag = self
                .tag(existing.id, resource)?
                .ok_or_else(|| BrokerError::not_found("Tag", existing.id))?;
            return Ok((tag, false));
        }

        let parent = changes.parent_id.flatten();
        if let Some(parent) = parent {
            self.require_tag(parent)?;
        }
        let type_id = self.tag_type_id(changes.tag_type.as_deref().unwrap_or(Tag::DEFAULT_TYPE))?;
        let id = QueryBuilder::insert("tags")
            .value("gid", gid)
            .value("parent_id", parent.map(|p| p.0))
            .value("type_id", type_id)
            .insert_id(self.conn())?;
        let id = TagId(id);
        self.write_tag_attributes(id, changes)?;
        if let (Some(resource), Some(remote_id)) = (resource, &changes.remote_id) {
            self.set_tag_remote_id(id, resource, remote_id)?;
        }

        let tag = self
            .tag(id, resource)?
            .ok_or_else(|| BrokerError::not_found("Tag", id))?;
        self.collector.tag_added(&tag);
        Ok((tag, true))
    }

    pub fn update_tag(&mut self, id: TagId, changes: &TagChanges, resource: Option<&str>) -> Result<Tag> {
        let current = self.require_tag(id)?;

        let mut update = QueryBuilder::update("tags").where_value("id", Equals, id.0);
        let mut has_columns = false;
        if let Some(gid) = changes.gid.as_ref().filter(|g| **g != current.gid) {
            if gid.is_empty() {
                return Err(BrokerError::syntax("Tag GID must not be empty").into());
            }
            update = update.value("gid", gid.as_str());
            has_columns = true;
        }
        if let Some(parent) = changes.parent_id {
            if let Some(parent) = parent {
                if self.tag_ancestry(parent)?.contains(&id) {
                    return Err(BrokerError::constraint(format!(
                        "Tag {} cannot become a child of its descendant {}",
                        id, parent
                    ))
                    .into());
                }
            }
            update = update.value("parent_id", parent.map(|p| p.0));
            has_columns = true;
        }
        if let Some(tag_type) = &changes.tag_type {
            let type_id = self.tag_type_id(tag_type)?;
            update = update.value("type_id", type_id);
            has_columns = true;
        }
        if has_columns {
            update.exec(self.conn())?;
        }
        self.write_tag_attributes(id, changes)?;
        if let (Some(resource), Some(remote_id)) = (resource, &changes.remote_id) {
            self.set_tag_remote_id(id, resource, remote_id)?;
        }

        let tag = self
            .tag(id, resource)?
            .ok_or_else(|| BrokerError::not_found("Tag", id))?;
        if has_columns || !changes.attributes.is_empty() || !changes.removed_attributes.is_empty() {
            self.collector.tag_changed(&tag);
        }
        Ok(tag)
    }

    /// `id` followed by its parents up to the root
    fn tag_ancestry(&self, id: TagId) -> Result<Vec<TagId>> {
        let mut chain = vec![id];
        let mut current = self.require_tag(id)?;
        while let Some(parent) = current.parent_id {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = self.require_tag(parent)?;
        }
        Ok(chain)
    }

    /// Delete a tag; notifies every resource holding a remote id for it
    pub fn remove_tag(&mut self, id: TagId) -> Result<Tag> {
        let tag = self.require_tag(id)?;
        let mut stmt = self.conn().prepare_cached(
            "SELECT resource_id, remote_id FROM tag_remote_ids WHERE tag_id = ?1 ORDER BY resource_id",
        )?;
        let rows = stmt
            .query_map([id.0], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut remote_ids = Vec::with_capacity(rows.len());
        for (resource_id, remote_id) in rows {
            if let Some(resource) = lookup::name_of(self.conn(), Lookup::Resource, resource_id)? {
                remote_ids.push((resource, remote_id));
            }
        }

        self.conn().execute("DELETE FROM tags WHERE id = ?1", [id.0])?;
        self.collector.tag_removed(&tag, &remote_ids);
        Ok(tag)
    }
}
