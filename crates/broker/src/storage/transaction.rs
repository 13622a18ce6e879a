//! Transaction scope
//!
//! A transaction owns one pooled connection and the events its mutations
//! produced. `commit` stamps and journals the events, commits, and publishes
//! them under the store's commit lock. Dropping without commit rolls back
//! and discards the events.

use anyhow::Result;
use log::{debug, warn};
use rusqlite::Connection;

use super::pool::{self, PooledConnection};
use super::Store;
use crate::notify::NotificationCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// `BEGIN IMMEDIATE`: takes the write lock up front
    Write,
    /// `BEGIN DEFERRED`
    Read,
}

pub struct Transaction<'a> {
    pub(super) store: &'a Store,
    conn: PooledConnection,
    pub(super) collector: NotificationCollector,
    mode: TransactionMode,
    finished: bool,
    /// Part files written by this transaction; removed on rollback
    pub(super) new_files: Vec<String>,
    /// Part files superseded or orphaned; removed after commit
    pub(super) obsolete_files: Vec<String>,
}

impl<'a> Transaction<'a> {
    pub(super) fn begin(store: &'a Store, session: &str, mode: TransactionMode) -> Result<Self> {
        let mut conn = pool::checkout(&store.pool)?;
        let begin = match mode {
            TransactionMode::Write => "BEGIN IMMEDIATE",
            TransactionMode::Read => "BEGIN DEFERRED",
        };
        if let Err(e) = conn.execute_batch(begin) {
            let err = anyhow::Error::from(e);
            if crate::error::is_fatal(&err) {
                conn.discard();
            }
            return Err(err);
        }
        Ok(Self {
            store,
            conn,
            collector: NotificationCollector::new(session),
            mode,
            finished: false,
            new_files: Vec::new(),
            obsolete_files: Vec::new(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn session(&self) -> &str {
        self.collector.session()
    }

    pub fn collector(&self) -> &NotificationCollector {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut NotificationCollector {
        &mut self.collector
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    /// Drop the connection from the pool once this transaction ends
    pub fn discard_connection(&mut self) {
        self.conn.discard();
    }

    /// Commit and publish; returns the number of events published
    pub fn commit(mut self) -> Result<usize> {
        let store = self.store;
        let mut notifications = self.collector.take();

        let published = if notifications.is_empty() {
            self.finish_commit()?;
            0
        } else {
            let _order = store
                .commit_lock
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
            store.bus.stamp(&mut notifications);
            store.recorders.record(&self.conn, &notifications)?;
            self.finish_commit()?;
            let count = notifications.len();
            store.bus.publish(notifications)?;
            count
        };

        store.parts.delete_all(&self.obsolete_files);
        Ok(published)
    }

    fn finish_commit(&mut self) -> Result<()> {
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            let err = anyhow::Error::from(e);
            if crate::error::is_fatal(&err) {
                self.conn.discard();
            }
            return Err(err);
        }
        self.finished = true;
        Ok(())
    }

    /// Abort, discarding every queued event
    pub fn rollback(mut self) -> Result<()> {
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.collector.is_empty() {
            debug!("Rolling back, discarding {} events", self.collector.len());
        }
        self.collector.clear();
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("Rollback failed, discarding connection: {}", e);
            self.conn.discard();
        }
        self.store.parts.delete_all(&self.new_files);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}
