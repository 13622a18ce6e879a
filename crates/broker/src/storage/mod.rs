//! Transactional entity storage
//!
//! [`Store`] owns the connection pool, the external part files and the
//! change-recorder registry. All entity access goes through a
//! [`Transaction`]; committing it publishes the events it collected.

mod collections;
pub mod dialect;
mod items;
mod lookup;
mod part_store;
mod parts;
mod pool;
pub mod query;
mod relations;
pub(crate) mod schema;
mod tags;
mod transaction;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::info;

pub use collections::{CollectionFilter, SEARCH_RESOURCE};
pub use items::{ItemFilter, PurgeCandidate};
pub use part_store::PartStore;
use parts::orphaned_files;
use pool::{Pool, create_pool};
pub use relations::RelationFilter;
pub use transaction::{Transaction, TransactionMode};

use crate::config::StorageConfig;
use crate::notify::{MonitorFilter, Notification, NotificationBus, RecorderRegistry, last_committed_sequence};

pub struct Store {
    pool: Pool,
    parts: PartStore,
    bus: Arc<NotificationBus>,
    recorders: RecorderRegistry,
    /// Serializes commit with publish so delivery follows commit order
    commit_lock: Mutex<()>,
    external_threshold: usize,
}

impl Store {
    /// Open or create the store under `data_dir`
    pub fn open(data_dir: &Path, config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        let db_path = data_dir.join(&config.database);
        let pool = create_pool(
            &db_path,
            config.pool_size,
            config.busy_timeout(),
            config.checkout_timeout(),
        )?;

        let mut conn = pool::checkout(&pool)?;
        schema::initialize(&mut conn).context("Failed to run database migrations")?;
        let recorders = RecorderRegistry::load(&conn)?;
        let bus = Arc::new(NotificationBus::starting_at(last_committed_sequence(&conn)? + 1));
        drop(conn);

        let parts = PartStore::new(data_dir.join(&config.parts_dir))?;
        info!("Opened store at {:?}", db_path);

        let store = Self {
            pool,
            parts,
            bus,
            recorders,
            commit_lock: Mutex::new(()),
            external_threshold: config.external_threshold,
        };
        store.sweep_orphaned_parts()?;
        Ok(store)
    }

    /// Delete part files that no stored part references. These are left
    /// behind when the process dies between writing a file and committing,
    /// or when a post-commit delete fails. Only run while no transaction can
    /// be writing files.
    fn sweep_orphaned_parts(&self) -> Result<usize> {
        let tx = self.begin_read("startup")?;
        let referenced = tx.referenced_part_files()?;
        tx.rollback()?;
        let orphans = orphaned_files(&self.parts, &referenced)?;
        if !orphans.is_empty() {
            info!("Removing {} orphaned part files", orphans.len());
            self.parts.delete_all(&orphans);
        }
        Ok(orphans.len())
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn part_store(&self) -> &PartStore {
        &self.parts
    }

    pub fn external_threshold(&self) -> usize {
        self.external_threshold
    }

    /// Start a write transaction on behalf of `session`
    pub fn begin(&self, session: &str) -> Result<Transaction<'_>> {
        Transaction::begin(self, session, TransactionMode::Write)
    }

    /// Start a read transaction; it may still write, but takes the write
    /// lock only when it does
    pub fn begin_read(&self, session: &str) -> Result<Transaction<'_>> {
        Transaction::begin(self, session, TransactionMode::Read)
    }

    pub fn recorders(&self) -> &RecorderRegistry {
        &self.recorders
    }

    pub fn register_recorder(&self, name: &str, filter: MonitorFilter) -> Result<()> {
        let conn = pool::checkout(&self.pool)?;
        self.recorders.register(&conn, name, filter)
    }

    pub fn unregister_recorder(&self, name: &str) -> Result<bool> {
        let conn = pool::checkout(&self.pool)?;
        self.recorders.unregister(&conn, name)
    }

    pub fn replay_next(&self, name: &str) -> Result<Option<Notification>> {
        let conn = pool::checkout(&self.pool)?;
        self.recorders.next(&conn, name)
    }

    pub fn mark_processed(&self, name: &str, sequence: u64) -> Result<()> {
        let conn = pool::checkout(&self.pool)?;
        self.recorders.ack(&conn, name, sequence)
    }

    pub fn pending_changes(&self, name: &str) -> Result<usize> {
        let conn = pool::checkout(&self.pool)?;
        self.recorders.pending_count(&conn, name)
    }
}
