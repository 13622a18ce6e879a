//! Entity schema and migrations

use anyhow::Result;
use log::warn;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};

use super::dialect::Introspector;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: entity schema
        M::up(
            r#"
            -- Name-keyed lookup tables, filled lazily
            CREATE TABLE resources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                is_virtual INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE mime_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE flags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE tag_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE relation_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            -- Collection tree, one root per resource
            CREATE TABLE collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER REFERENCES collections(id) ON DELETE CASCADE,
                resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                remote_id TEXT,
                remote_revision TEXT,
                subscribed INTEGER NOT NULL DEFAULT 1,
                is_virtual INTEGER NOT NULL DEFAULT 0,
                cache_inherit INTEGER NOT NULL DEFAULT 1,
                cache_check_interval INTEGER NOT NULL DEFAULT -1,
                cache_timeout INTEGER NOT NULL DEFAULT -1,
                cache_sync_on_demand INTEGER NOT NULL DEFAULT 0,
                cache_local_parts TEXT NOT NULL DEFAULT 'ALL',
                revision INTEGER NOT NULL DEFAULT 0,
                search_spec TEXT
            );

            CREATE UNIQUE INDEX idx_collections_parent_name
                ON collections(coalesce(parent_id, 0), name);
            CREATE UNIQUE INDEX idx_collections_resource_root
                ON collections(resource_id) WHERE parent_id IS NULL;
            CREATE UNIQUE INDEX idx_collections_parent_remote_id
                ON collections(coalesce(parent_id, 0), resource_id, remote_id)
                WHERE remote_id IS NOT NULL;
            CREATE INDEX idx_collections_parent ON collections(parent_id);

            CREATE TABLE collection_mime_types (
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                mime_type_id INTEGER NOT NULL REFERENCES mime_types(id),
                PRIMARY KEY (collection_id, mime_type_id)
            );

            CREATE TABLE collection_attributes (
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (collection_id, name)
            );

            -- Items; times are unix milliseconds
            CREATE TABLE items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rev INTEGER NOT NULL DEFAULT 0,
                remote_id TEXT,
                remote_revision TEXT,
                gid TEXT,
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                mime_type_id INTEGER NOT NULL REFERENCES mime_types(id),
                mtime INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_items_collection ON items(collection_id);
            CREATE UNIQUE INDEX idx_items_collection_remote_id
                ON items(collection_id, remote_id) WHERE remote_id IS NOT NULL;
            CREATE INDEX idx_items_gid ON items(gid);

            CREATE TABLE item_flags (
                item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
                PRIMARY KEY (item_id, flag_id)
            );

            -- Payload parts; external parts keep their bytes in the part store
            CREATE TABLE parts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                data BLOB,
                external INTEGER NOT NULL DEFAULT 0,
                datasize INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                UNIQUE (item_id, name)
            );

            CREATE TABLE tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gid TEXT NOT NULL UNIQUE,
                parent_id INTEGER REFERENCES tags(id) ON DELETE CASCADE,
                type_id INTEGER NOT NULL REFERENCES tag_types(id)
            );

            CREATE TABLE tag_attributes (
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (tag_id, name)
            );

            CREATE TABLE tag_remote_ids (
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
                remote_id TEXT,
                PRIMARY KEY (tag_id, resource_id)
            );

            CREATE TABLE item_tags (
                item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (item_id, tag_id)
            );

            CREATE INDEX idx_item_tags_tag ON item_tags(tag_id);

            CREATE TABLE relations (
                left_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                right_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                type_id INTEGER NOT NULL REFERENCES relation_types(id),
                remote_id TEXT,
                PRIMARY KEY (left_id, right_id, type_id)
            );

            CREATE INDEX idx_relations_right ON relations(right_id);

            -- Persistent search membership
            CREATE TABLE virtual_links (
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                PRIMARY KEY (collection_id, item_id)
            );

            CREATE INDEX idx_virtual_links_item ON virtual_links(item_id);
            "#,
        ),
        // Migration 2: durable change recorders
        M::up(
            r#"
            CREATE TABLE change_recorders (
                name TEXT PRIMARY KEY,
                filter TEXT NOT NULL
            );

            CREATE TABLE change_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorder TEXT NOT NULL REFERENCES change_recorders(name) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE (recorder, sequence)
            );
            "#,
        ),
        // Migration 3: sequence high-water mark, kept when the journal is pruned
        M::up(
            r#"
            CREATE TABLE notification_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sequence INTEGER NOT NULL
            );

            INSERT INTO notification_state (id, last_sequence)
                SELECT 1, COALESCE(MAX(sequence), 0) FROM change_journal;
            "#,
        ),
    ])
}

/// Indexes the engine relies on for uniqueness rules
const REQUIRED_INDEXES: &[(&str, &str)] = &[
    ("collections", "idx_collections_parent_name"),
    ("collections", "idx_collections_resource_root"),
    ("collections", "idx_collections_parent_remote_id"),
    ("items", "idx_items_collection_remote_id"),
];

/// Bring a connection to the latest schema and verify it
pub fn initialize(conn: &mut Connection) -> Result<()> {
    migrations().to_latest(conn)?;
    verify(conn)
}

/// Report tables and indexes missing after migration
pub fn verify(conn: &Connection) -> Result<()> {
    let inspect = Introspector::new(conn);
    for table in ["collections", "items", "parts", "change_journal", "notification_state"] {
        if !inspect.has_table(table)? {
            anyhow::bail!("Schema is missing table {}", table);
        }
    }
    for (table, index) in REQUIRED_INDEXES {
        if !inspect.has_index(table, index)? {
            warn!("Schema is missing index {} on {}", index, table);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_in_memory() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        let inspect = Introspector::new(&conn);
        assert!(inspect.has_table("virtual_links").unwrap());
        assert!(inspect.has_index("items", "idx_items_collection_remote_id").unwrap());
    }

    #[test]
    fn test_root_per_resource_is_unique() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO resources (name) VALUES ('imap');
             INSERT INTO collections (resource_id, name) VALUES (1, 'imap');",
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO collections (resource_id, name) VALUES (1, 'other')",
            [],
        );
        assert!(second.is_err());
    }
}
