//! Item relations

use anyhow::Result;
use rusqlite::params;

use super::query::{CompareOperator, Condition, JoinType, QueryBuilder, SortOrder};
use super::Transaction;
use crate::error::BrokerError;
use crate::models::{Item, ItemId, Relation};

use CompareOperator::*;

/// Which relations RELATIONFETCH returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationFilter {
    pub left: Option<ItemId>,
    pub right: Option<ItemId>,
    /// Either side
    pub side: Option<ItemId>,
    pub types: Vec<String>,
}

impl Transaction<'_> {
    pub fn relations(&self, filter: &RelationFilter) -> Result<Vec<Relation>> {
        let mut query = QueryBuilder::select("relations")
            .columns(&[
                "relations.left_id",
                "relations.right_id",
                "relation_types.name",
                "relations.remote_id",
            ])
            .join(
                JoinType::Inner,
                "relation_types",
                Condition::and().column("relation_types.id", Equals, "relations.type_id"),
            )
            .order_by("relations.left_id", SortOrder::Ascending)
            .order_by("relations.right_id", SortOrder::Ascending);
        if let Some(left) = filter.left {
            query = query.where_value("relations.left_id", Equals, left.0);
        }
        if let Some(right) = filter.right {
            query = query.where_value("relations.right_id", Equals, right.0);
        }
        if let Some(side) = filter.side {
            query = query.where_condition(
                Condition::or()
                    .value("relations.left_id", Equals, side.0)
                    .value("relations.right_id", Equals, side.0),
            );
        }
        if !filter.types.is_empty() {
            query = query.where_in("relation_types.name", filter.types.iter().map(String::as_str));
        }
        query.query(self.conn(), |row| {
            Ok(Relation {
                left: ItemId(row.get(0)?),
                right: ItemId(row.get(1)?),
                relation_type: row.get(2)?,
                remote_id: row.get(3)?,
            })
        })
    }

    /// Both items changed relations; report it on each
    fn notify_relation_items(&mut self, relation: &Relation, added: bool) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for id in [relation.left, relation.right] {
            if items.iter().any(|i: &Item| i.id == id) {
                continue;
            }
            let item = self.require_item(id)?;
            let resource = self.require_collection(item.collection_id)?.resource;
            let (added, removed) = if added {
                (vec![relation.clone()], Vec::new())
            } else {
                (Vec::new(), vec![relation.clone()])
            };
            self.collector.items_relations_changed(
                std::slice::from_ref(&item),
                &resource,
                item.collection_id,
                added,
                removed,
            );
            items.push(item);
        }
        Ok(items)
    }

    /// Create or update a relation
    pub fn add_relation(&mut self, relation: &Relation) -> Result<Relation> {
        if relation.relation_type.is_empty() {
            return Err(BrokerError::syntax("Relation needs a type").into());
        }
        self.require_item(relation.left)?;
        self.require_item(relation.right)?;
        let type_id = self.relation_type_id(&relation.relation_type)?;

        let existing = self.relations(&RelationFilter {
            left: Some(relation.left),
            right: Some(relation.right),
            types: vec![relation.relation_type.clone()],
            ..Default::default()
        })?;
        if let Some(existing) = existing.into_iter().next() {
            if existing.remote_id != relation.remote_id {
                self.conn().execute(
                    "UPDATE relations SET remote_id = ?1 WHERE left_id = ?2 AND right_id = ?3 AND type_id = ?4",
                    params![relation.remote_id, relation.left.0, relation.right.0, type_id],
                )?;
            }
            return Ok(relation.clone());
        }

        self.conn().execute(
            "INSERT INTO relations (left_id, right_id, type_id, remote_id) VALUES (?1, ?2, ?3, ?4)",
            params![relation.left.0, relation.right.0, type_id, relation.remote_id],
        )?;
        self.collector.relation_added(relation);
        self.notify_relation_items(relation, true)?;
        Ok(relation.clone())
    }

    /// Remove relations between two items, of one type or of every type
    pub fn remove_relations(
        &mut self,
        left: ItemId,
        right: ItemId,
        relation_type: Option<&str>,
    ) -> Result<Vec<Relation>> {
        let filter = RelationFilter {
            left: Some(left),
            right: Some(right),
            types: relation_type.map(|t| vec![t.to_string()]).unwrap_or_default(),
            ..Default::default()
        };
        let removed = self.relations(&filter)?;
        for relation in &removed {
            QueryBuilder::delete("relations")
                .where_value("left_id", Equals, relation.left.0)
                .where_value("right_id", Equals, relation.right.0)
                .where_value("type_id", Equals, self.relation_type_id(&relation.relation_type)?)
                .exec(self.conn())?;
            self.collector.relation_removed(relation);
            self.notify_relation_items(relation, false)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::Collection;
    use crate::notify::{EntityKind, ItemOperation};
    use crate::storage::Store;
    use tempfile::{TempDir, tempdir};

    fn setup(tx: &mut Transaction<'_>) -> (Item, Item) {
        let mut root = Collection::new("local", None);
        root.resource = "local".into();
        tx.append_collection(&mut root).unwrap();
        let mut a = Item::new(root.id, "text/plain");
        let mut b = Item::new(root.id, "text/plain");
        tx.append_item(&mut a, &[]).unwrap();
        tx.append_item(&mut b, &[]).unwrap();
        tx.collector_mut().clear();
        (a, b)
    }

    fn store() -> (TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), &StorageConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_fetch_remove() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let (a, b) = setup(&mut tx);

        let relation = Relation::new(a.id, b.id, Relation::GENERIC);
        tx.add_relation(&relation).unwrap();
        tx.add_relation(&relation).unwrap();

        let by_side = tx
            .relations(&RelationFilter {
                side: Some(b.id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_side, vec![relation.clone()]);

        let other_type = tx
            .relations(&RelationFilter {
                types: vec!["OTHER".into()],
                ..Default::default()
            })
            .unwrap();
        assert!(other_type.is_empty());

        let removed = tx.remove_relations(a.id, b.id, None).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(tx.relations(&RelationFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_add_notifies_relation_and_both_items() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let (a, b) = setup(&mut tx);
        tx.add_relation(&Relation::new(a.id, b.id, Relation::GENERIC)).unwrap();

        let pending = tx.collector().pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].change.kind(), EntityKind::Relations);
        assert!(
            pending[1..]
                .iter()
                .all(|n| n.item().unwrap().operation == ItemOperation::ModifyRelations)
        );
    }

    #[test]
    fn test_missing_item_is_rejected() {
        let (_dir, store) = store();
        let mut tx = store.begin("test").unwrap();
        let (a, _) = setup(&mut tx);
        assert!(
            tx.add_relation(&Relation::new(a.id, ItemId(999), Relation::GENERIC))
                .is_err()
        );
    }
}
