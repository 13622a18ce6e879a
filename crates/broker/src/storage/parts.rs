//! Item payload parts
//!
//! Small parts live in the `parts.data` column. Parts above the store's
//! external threshold are written to the [`PartStore`](super::PartStore) and
//! the column holds the file name instead. Files written by a transaction are
//! removed if it rolls back; files it supersedes are removed after commit.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::items::PurgeCandidate;
use super::part_store::PartStore;
use super::query::{CompareOperator, QueryBuilder};
use super::Transaction;
use crate::error::BrokerError;
use crate::models::{ItemId, Part, parts};

/// A stored part row; `data` is the file name when `external`
struct PartRow {
    id: i64,
    name: String,
    data: Option<Vec<u8>>,
    external: bool,
    size: i64,
    version: i64,
}

fn file_name(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

impl Transaction<'_> {
    fn part_rows(&self, item: ItemId) -> Result<Vec<PartRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, name, data, external, datasize, version FROM parts
             WHERE item_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([item.0], |row| {
                Ok(PartRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    data: row.get(2)?,
                    external: row.get(3)?,
                    size: row.get(4)?,
                    version: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn load_part(&self, row: PartRow) -> Result<Part> {
        let data = match (row.data, row.external) {
            (Some(name), true) => {
                let name = file_name(&name);
                let data = self
                    .store
                    .part_store()
                    .get(&name)?
                    .ok_or_else(|| BrokerError::constraint(format!("Part file {} is missing", name)))?;
                Some(data)
            }
            (data, _) => data,
        };
        Ok(Part {
            name: row.name,
            data,
            size: row.size,
            version: row.version,
        })
    }

    /// Parts of an item, all of them or only the named ones
    pub fn parts_of(&self, item: ItemId, names: Option<&BTreeSet<String>>) -> Result<Vec<Part>> {
        let mut parts = Vec::new();
        for row in self.part_rows(item)? {
            if names.is_some_and(|n| !n.contains(&row.name)) {
                continue;
            }
            parts.push(
                self.load_part(row)
                    .with_context(|| format!("Failed to load part of item {}", item))?,
            );
        }
        Ok(parts)
    }

    /// Wanted payload parts that are not cached locally
    pub fn missing_parts(&self, item: ItemId, wanted: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let mut missing = wanted.clone();
        for row in self.part_rows(item)? {
            if row.data.is_some() {
                missing.remove(&row.name);
            }
        }
        Ok(missing)
    }

    /// Create or overwrite one part; bumps its version
    pub(super) fn write_part(&mut self, item: ItemId, part: &Part) -> Result<()> {
        if !parts::is_valid(&part.name) {
            return Err(BrokerError::syntax(format!("Invalid part name {:?}", part.name)).into());
        }
        let existing = self
            .conn()
            .query_row(
                "SELECT id, data, external, version FROM parts WHERE item_id = ?1 AND name = ?2",
                params![item.0, part.name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let size = part.data.as_ref().map_or(part.size, |d| d.len() as i64);
        let (part_id, version) = match existing {
            Some((id, data, external, version)) => {
                if let (Some(old), true) = (data, external) {
                    self.obsolete_files.push(file_name(&old));
                }
                (id, version + 1)
            }
            None => {
                self.conn().execute(
                    "INSERT INTO parts (item_id, name, data, external, datasize, version)
                     VALUES (?1, ?2, NULL, 0, ?3, 0)",
                    params![item.0, part.name, size],
                )?;
                (self.conn().last_insert_rowid(), 0)
            }
        };

        let external = part
            .data
            .as_ref()
            .is_some_and(|d| d.len() > self.store.external_threshold());
        let stored: Option<Vec<u8>> = if external {
            let data = part.data.as_deref().unwrap_or_default();
            let name = self.store.part_store().put(part_id, version, data)?;
            self.new_files.push(name.clone());
            Some(name.into_bytes())
        } else {
            part.data.clone()
        };

        self.conn().execute(
            "UPDATE parts SET data = ?1, external = ?2, datasize = ?3, version = ?4 WHERE id = ?5",
            params![stored, external, size, version, part_id],
        )?;
        Ok(())
    }

    /// Delete named parts; returns how many existed
    pub(super) fn delete_parts(&mut self, item: ItemId, names: &BTreeSet<String>) -> Result<usize> {
        let mut removed = 0;
        for row in self.part_rows(item)? {
            if !names.contains(&row.name) {
                continue;
            }
            if let (Some(data), true) = (&row.data, row.external) {
                self.obsolete_files.push(file_name(data));
            }
            self.conn().execute("DELETE FROM parts WHERE id = ?1", [row.id])?;
            removed += 1;
        }
        Ok(removed)
    }

    /// External files referenced by the given items' parts
    pub(super) fn external_files(&self, items: &[ItemId]) -> Result<Vec<String>> {
        let files = QueryBuilder::select("parts")
            .column("data")
            .where_in("item_id", items.iter().map(|i| i.0))
            .where_value("external", CompareOperator::Equals, true)
            .query(self.conn(), |row| row.get::<_, Vec<u8>>(0))?;
        Ok(files.iter().map(|f| file_name(f)).collect())
    }

    /// Drop cached payload of the candidates. Metadata, sizes and revisions
    /// stay; the parts can be fetched from the resource again.
    pub fn purge_payload(&mut self, candidates: &[PurgeCandidate]) -> Result<usize> {
        let mut purged = 0;
        for candidate in candidates {
            for row in self.part_rows(candidate.item)? {
                if !candidate.parts.contains(&row.name) || row.data.is_none() {
                    continue;
                }
                if let (Some(data), true) = (&row.data, row.external) {
                    self.obsolete_files.push(file_name(data));
                }
                self.conn().execute(
                    "UPDATE parts SET data = NULL, external = 0 WHERE id = ?1",
                    [row.id],
                )?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Names of every part file the database references
    pub fn referenced_part_files(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT data FROM parts WHERE external = 1 AND data IS NOT NULL")?;
        let names = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .map(|r| r.map(|d| file_name(&d)))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(names)
    }
}

/// File names in `store` that no part references any more
pub(super) fn orphaned_files(store: &PartStore, referenced: &BTreeSet<String>) -> Result<Vec<String>> {
    let mut orphans = Vec::new();
    if !store.root().exists() {
        return Ok(orphans);
    }
    for shard in std::fs::read_dir(store.root())? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(shard.path())? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) {
                orphans.push(name);
            }
        }
    }
    orphans.sort();
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::{Collection, Item};
    use crate::storage::Store;
    use tempfile::{TempDir, tempdir};

    fn store(threshold: usize) -> (TempDir, Store) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            external_threshold: threshold,
            ..Default::default()
        };
        let store = Store::open(dir.path(), &config).unwrap();
        (dir, store)
    }

    fn item_in_new_collection(tx: &mut Transaction<'_>) -> Item {
        let mut root = Collection::new("local", None);
        root.resource = "local".into();
        tx.append_collection(&mut root).unwrap();
        let mut item = Item::new(root.id, "text/plain");
        tx.append_item(&mut item, &[]).unwrap();
        item
    }

    #[test]
    fn test_small_part_stays_inline() {
        let (_dir, store) = store(1024);
        let mut tx = store.begin("test").unwrap();
        let item = item_in_new_collection(&mut tx);
        tx.write_part(item.id, &Part::new("PLD:RFC822", b"hello".to_vec())).unwrap();
        tx.write_part(item.id, &Part::new("PLD:RFC822", b"hello again".to_vec())).unwrap();

        let parts = tx.parts_of(item.id, None).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].data.as_deref(), Some(&b"hello again"[..]));
        assert_eq!(parts[0].version, 1);
        assert!(tx.referenced_part_files().unwrap().is_empty());
    }

    #[test]
    fn test_large_part_goes_external_and_old_file_is_removed_after_commit() {
        let (_dir, store) = store(4);
        let mut tx = store.begin("test").unwrap();
        let item = item_in_new_collection(&mut tx);
        tx.write_part(item.id, &Part::new("PLD:RFC822", vec![7u8; 64])).unwrap();
        tx.commit().unwrap();

        let first: Vec<String> = {
            let tx = store.begin_read("test").unwrap();
            tx.referenced_part_files().unwrap().into_iter().collect()
        };
        assert_eq!(first.len(), 1);
        assert!(store.part_store().exists(&first[0]));

        let mut tx = store.begin("test").unwrap();
        tx.write_part(item.id, &Part::new("PLD:RFC822", vec![9u8; 64])).unwrap();
        assert_eq!(tx.parts_of(item.id, None).unwrap()[0].data, Some(vec![9u8; 64]));
        tx.commit().unwrap();

        assert!(!store.part_store().exists(&first[0]));
    }

    #[test]
    fn test_rollback_removes_new_files() {
        let (_dir, store) = store(4);
        let name = {
            let mut tx = store.begin("test").unwrap();
            let item = item_in_new_collection(&mut tx);
            tx.write_part(item.id, &Part::new("PLD:RFC822", vec![1u8; 32])).unwrap();
            let name = tx.referenced_part_files().unwrap().into_iter().next().unwrap();
            assert!(store.part_store().exists(&name));
            name
        };
        assert!(!store.part_store().exists(&name));
    }

    #[test]
    fn test_missing_and_purged_parts() {
        let (_dir, store) = store(1024);
        let mut tx = store.begin("test").unwrap();
        let item = item_in_new_collection(&mut tx);
        tx.write_part(item.id, &Part::new("PLD:RFC822", b"body".to_vec())).unwrap();
        tx.write_part(item.id, &Part::new("PLD:HEAD", b"head".to_vec())).unwrap();

        let wanted: BTreeSet<String> = ["PLD:RFC822".to_string(), "PLD:ENVELOPE".to_string()].into();
        assert_eq!(
            tx.missing_parts(item.id, &wanted).unwrap(),
            ["PLD:ENVELOPE".to_string()].into()
        );

        let purged = tx
            .purge_payload(&[PurgeCandidate {
                item: item.id,
                parts: vec!["PLD:RFC822".to_string()],
            }])
            .unwrap();
        assert_eq!(purged, 1);
        let parts = tx.parts_of(item.id, None).unwrap();
        let body = parts.iter().find(|p| p.name == "PLD:RFC822").unwrap();
        assert!(!body.is_cached());
        assert_eq!(body.size, 4);
        assert!(parts.iter().find(|p| p.name == "PLD:HEAD").unwrap().is_cached());
    }

    #[test]
    fn test_invalid_part_name_is_rejected() {
        let (_dir, store) = store(1024);
        let mut tx = store.begin("test").unwrap();
        let item = item_in_new_collection(&mut tx);
        assert!(tx.write_part(item.id, &Part::new("BODY", b"x".to_vec())).is_err());
    }

    #[test]
    fn test_orphaned_files() {
        let dir = tempdir().unwrap();
        let parts = PartStore::new(dir.path()).unwrap();
        let kept = parts.put(1, 0, b"a").unwrap();
        let stray = parts.put(2, 0, b"b").unwrap();
        let referenced: BTreeSet<String> = [kept].into();
        assert_eq!(orphaned_files(&parts, &referenced).unwrap(), vec![stray]);
    }
}
