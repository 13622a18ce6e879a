//! Name-keyed lookup tables, created on first use

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

use super::Transaction;

/// Tables holding `(id, name)` rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Lookup {
    Resource,
    MimeType,
    Flag,
    TagType,
    RelationType,
}

impl Lookup {
    fn table(&self) -> &'static str {
        match self {
            Lookup::Resource => "resources",
            Lookup::MimeType => "mime_types",
            Lookup::Flag => "flags",
            Lookup::TagType => "tag_types",
            Lookup::RelationType => "relation_types",
        }
    }
}

pub(super) fn find(conn: &Connection, lookup: Lookup, name: &str) -> Result<Option<i64>> {
    let sql = format!("SELECT id FROM {} WHERE name = ?1", lookup.table());
    Ok(conn
        .prepare_cached(&sql)?
        .query_row([name], |row| row.get(0))
        .optional()?)
}

pub(super) fn find_or_insert(conn: &Connection, lookup: Lookup, name: &str) -> Result<i64> {
    if let Some(id) = find(conn, lookup, name)? {
        return Ok(id);
    }
    let sql = format!("INSERT INTO {} (name) VALUES (?1)", lookup.table());
    conn.prepare_cached(&sql)?.execute([name])?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn name_of(conn: &Connection, lookup: Lookup, id: i64) -> Result<Option<String>> {
    let sql = format!("SELECT name FROM {} WHERE id = ?1", lookup.table());
    Ok(conn
        .prepare_cached(&sql)?
        .query_row([id], |row| row.get(0))
        .optional()?)
}

impl Transaction<'_> {
    /// Resource id, registering the resource if it is new
    pub fn resource_id(&self, name: &str) -> Result<i64> {
        find_or_insert(self.conn(), Lookup::Resource, name)
    }

    pub fn find_resource_id(&self, name: &str) -> Result<Option<i64>> {
        find(self.conn(), Lookup::Resource, name)
    }

    pub fn resources(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare("SELECT name FROM resources ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn mime_type_id(&self, name: &str) -> Result<i64> {
        find_or_insert(self.conn(), Lookup::MimeType, &name.to_ascii_lowercase())
    }

    pub fn flag_id(&self, name: &str) -> Result<i64> {
        find_or_insert(self.conn(), Lookup::Flag, name)
    }

    pub fn tag_type_id(&self, name: &str) -> Result<i64> {
        find_or_insert(self.conn(), Lookup::TagType, name)
    }

    pub fn relation_type_id(&self, name: &str) -> Result<i64> {
        find_or_insert(self.conn(), Lookup::RelationType, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    #[test]
    fn test_find_or_insert_is_stable() {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::initialize(&mut conn).unwrap();

        assert_eq!(find(&conn, Lookup::Flag, "\\SEEN").unwrap(), None);
        let id = find_or_insert(&conn, Lookup::Flag, "\\SEEN").unwrap();
        assert_eq!(find_or_insert(&conn, Lookup::Flag, "\\SEEN").unwrap(), id);
        assert_eq!(name_of(&conn, Lookup::Flag, id).unwrap().as_deref(), Some("\\SEEN"));

        let other = find_or_insert(&conn, Lookup::MimeType, "\\SEEN").unwrap();
        assert_eq!(other, 1);
    }
}
