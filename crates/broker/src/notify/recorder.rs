//! Durable change recorders
//!
//! A recorder is a named, persisted filter. Matching events are journaled in
//! the committing transaction, so a recorder never misses a committed change
//! and never sees a rolled-back one. Consumers replay the oldest pending
//! event and acknowledge it; until acknowledged it is replayed again.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};

use super::event::Notification;
use super::filter::MonitorFilter;
use crate::error::BrokerError;

/// Cache of recorder filters backed by the `change_recorders` table
#[derive(Default)]
pub struct RecorderRegistry {
    filters: RwLock<HashMap<String, MonitorFilter>>,
}

impl RecorderRegistry {
    /// Load every registered recorder
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare("SELECT name, filter FROM change_recorders")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut filters = HashMap::new();
        for (name, filter) in rows {
            let filter: MonitorFilter = serde_json::from_str(&filter)
                .with_context(|| format!("Corrupt filter for recorder {}", name))?;
            filters.insert(name, filter);
        }
        if !filters.is_empty() {
            info!("Loaded {} change recorders", filters.len());
        }
        Ok(Self {
            filters: RwLock::new(filters),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.filters
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn filter(&self, name: &str) -> Option<MonitorFilter> {
        self.filters.read().ok().and_then(|f| f.get(name).cloned())
    }

    /// Create or replace a recorder; pending events are kept
    pub fn register(&self, conn: &Connection, name: &str, filter: MonitorFilter) -> Result<()> {
        if name.is_empty() {
            return Err(BrokerError::syntax("Recorder name must not be empty").into());
        }
        let json = serde_json::to_string(&filter)?;
        conn.execute(
            "INSERT INTO change_recorders (name, filter) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET filter = excluded.filter",
            params![name, json],
        )?;
        self.filters
            .write()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .insert(name.to_string(), filter);
        debug!("Registered change recorder {}", name);
        Ok(())
    }

    /// Drop a recorder and its journal
    pub fn unregister(&self, conn: &Connection, name: &str) -> Result<bool> {
        let removed = conn.execute("DELETE FROM change_recorders WHERE name = ?1", [name])?;
        self.filters
            .write()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .remove(name);
        Ok(removed > 0)
    }

    /// Journal stamped events for every recorder whose filter accepts them.
    /// Runs inside the committing transaction.
    pub fn record(&self, conn: &Connection, notifications: &[Notification]) -> Result<usize> {
        let filters = self
            .filters
            .read()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        let Some(highest) = notifications.iter().map(|n| n.sequence).max() else {
            return Ok(0);
        };
        conn.execute(
            "UPDATE notification_state SET last_sequence = MAX(last_sequence, ?1) WHERE id = 1",
            [highest as i64],
        )?;
        if filters.is_empty() {
            return Ok(0);
        }

        let mut stmt = conn.prepare_cached(
            "INSERT INTO change_journal (recorder, sequence, payload) VALUES (?1, ?2, ?3)",
        )?;
        let mut written = 0;
        for notification in notifications {
            let mut payload = None;
            for (name, filter) in filters.iter() {
                if !filter.accepts(notification) {
                    continue;
                }
                if payload.is_none() {
                    payload = Some(serde_json::to_string(notification)?);
                }
                stmt.execute(params![name, notification.sequence as i64, payload])?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Oldest unacknowledged event
    pub fn next(&self, conn: &Connection, name: &str) -> Result<Option<Notification>> {
        self.ensure_known(name)?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM change_journal WHERE recorder = ?1
                 ORDER BY sequence ASC LIMIT 1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).context("Corrupt change journal entry"))
            .transpose()
    }

    /// Mark one replayed event processed
    pub fn ack(&self, conn: &Connection, name: &str, sequence: u64) -> Result<()> {
        self.ensure_known(name)?;
        let removed = conn.execute(
            "DELETE FROM change_journal WHERE recorder = ?1 AND sequence = ?2",
            params![name, sequence as i64],
        )?;
        if removed == 0 {
            return Err(BrokerError::not_found("Pending change", sequence).into());
        }
        Ok(())
    }

    pub fn pending_count(&self, conn: &Connection, name: &str) -> Result<usize> {
        self.ensure_known(name)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_journal WHERE recorder = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn ensure_known(&self, name: &str) -> Result<()> {
        let known = self
            .filters
            .read()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .contains_key(name);
        if known {
            Ok(())
        } else {
            Err(BrokerError::not_found("Change recorder", name).into())
        }
    }
}

/// Highest sequence ever committed, used to resume the bus counter
pub fn last_committed_sequence(conn: &Connection) -> Result<u64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_sequence FROM notification_state WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(last.unwrap_or(0).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionId, Item, ItemId};
    use crate::notify::collector::NotificationCollector;
    use crate::storage::schema;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        schema::migrations().to_latest(&mut conn).unwrap();
        conn
    }

    fn stamped(first: u64, resources: &[&str]) -> Vec<Notification> {
        let mut collector = NotificationCollector::new("client");
        for (i, resource) in resources.iter().enumerate() {
            let mut item = Item::new(CollectionId(1), "text/plain");
            item.id = ItemId(i as i64 + 1);
            collector.item_added(&item, resource);
        }
        let mut events = collector.take();
        for (i, event) in events.iter_mut().enumerate() {
            event.sequence = first + i as u64;
        }
        events
    }

    #[test]
    fn test_replay_until_acknowledged() {
        let conn = conn();
        let registry = RecorderRegistry::load(&conn).unwrap();
        registry
            .register(&conn, "indexer", MonitorFilter::default().with_resource("imap"))
            .unwrap();

        let written = registry.record(&conn, &stamped(5, &["imap", "dav", "imap"])).unwrap();
        assert_eq!(written, 2);
        assert_eq!(registry.pending_count(&conn, "indexer").unwrap(), 2);

        let first = registry.next(&conn, "indexer").unwrap().unwrap();
        assert_eq!(first.sequence, 5);
        // not acknowledged: replayed again
        assert_eq!(registry.next(&conn, "indexer").unwrap().unwrap().sequence, 5);

        registry.ack(&conn, "indexer", 5).unwrap();
        assert_eq!(registry.next(&conn, "indexer").unwrap().unwrap().sequence, 7);
        registry.ack(&conn, "indexer", 7).unwrap();
        assert!(registry.next(&conn, "indexer").unwrap().is_none());
        // an empty journal does not rewind the counter
        assert_eq!(last_committed_sequence(&conn).unwrap(), 7);
    }

    #[test]
    fn test_sequence_kept_without_recorders() {
        let conn = conn();
        let registry = RecorderRegistry::load(&conn).unwrap();
        assert_eq!(last_committed_sequence(&conn).unwrap(), 0);
        assert_eq!(registry.record(&conn, &stamped(12, &["imap", "dav"])).unwrap(), 0);
        assert_eq!(last_committed_sequence(&conn).unwrap(), 13);
        registry.record(&conn, &stamped(3, &["imap"])).unwrap();
        assert_eq!(last_committed_sequence(&conn).unwrap(), 13);
    }

    #[test]
    fn test_registry_survives_reload() {
        let conn = conn();
        let registry = RecorderRegistry::load(&conn).unwrap();
        registry.register(&conn, "sync", MonitorFilter::all()).unwrap();
        registry.record(&conn, &stamped(1, &["imap"])).unwrap();

        let reloaded = RecorderRegistry::load(&conn).unwrap();
        assert_eq!(reloaded.names(), vec!["sync".to_string()]);
        assert_eq!(reloaded.pending_count(&conn, "sync").unwrap(), 1);
        assert_eq!(last_committed_sequence(&conn).unwrap(), 1);
    }

    #[test]
    fn test_unregister_drops_journal() {
        let conn = conn();
        let registry = RecorderRegistry::load(&conn).unwrap();
        registry.register(&conn, "sync", MonitorFilter::all()).unwrap();
        registry.record(&conn, &stamped(1, &["imap"])).unwrap();
        assert!(registry.unregister(&conn, "sync").unwrap());
        assert!(registry.next(&conn, "sync").is_err());
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM change_journal", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_ack_of_unknown_sequence_fails() {
        let conn = conn();
        let registry = RecorderRegistry::load(&conn).unwrap();
        registry.register(&conn, "sync", MonitorFilter::all()).unwrap();
        assert!(registry.ack(&conn, "sync", 42).is_err());
    }
}
