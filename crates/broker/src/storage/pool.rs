//! SQLite connection pool
//!
//! An r2d2 pool over rusqlite connections. Every connection is opened with
//! the same pragmas and busy timeout. A connection marked broken, or handed
//! back while still inside a transaction, is closed instead of reused and
//! the pool opens a replacement on demand.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::warn;
use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::BrokerError;

pub type Pool = r2d2::Pool<ConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<ConnectionManager>;

// WAL lets readers proceed during a write; foreign keys drive the cascading
// deletes and are per connection.
const PRAGMAS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -16000;
    PRAGMA temp_store = MEMORY;
    PRAGMA foreign_keys = ON;
"#;

/// Build a pool of up to `size` connections to the database at `path`
pub fn create_pool(
    path: &Path,
    size: usize,
    busy_timeout: Duration,
    checkout_timeout: Duration,
) -> Result<Pool> {
    let manager = ConnectionManager::file(path, busy_timeout);
    r2d2::Pool::builder()
        .max_size(size.clamp(1, u32::MAX as usize) as u32)
        .min_idle(Some(1))
        .connection_timeout(checkout_timeout)
        .build(manager)
        .map_err(|e| unavailable(&e))
}

/// Check out a connection, waiting while all are in use
pub fn checkout(pool: &Pool) -> Result<PooledConnection> {
    pool.get().map_err(|e| unavailable(&e))
}

fn unavailable(err: &r2d2::Error) -> anyhow::Error {
    BrokerError::Fatal(format!("Storage backend unavailable: {}", err)).into()
}

/// A rusqlite connection that can be marked for closing
pub struct DbConnection {
    conn: Connection,
    broken: bool,
}

impl DbConnection {
    /// Close this connection instead of returning it to the pool
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl Deref for DbConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for DbConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Opens configured connections and retires broken ones
pub struct ConnectionManager {
    inner: SqliteConnectionManager,
}

impl ConnectionManager {
    pub fn file(path: &Path, busy_timeout: Duration) -> Self {
        let inner = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(PRAGMAS)
        });
        Self { inner }
    }
}

impl ManageConnection for ConnectionManager {
    type Connection = DbConnection;
    type Error = rusqlite::Error;

    fn connect(&self) -> std::result::Result<DbConnection, rusqlite::Error> {
        let conn = self.inner.connect()?;
        Ok(DbConnection { conn, broken: false })
    }

    fn is_valid(&self, conn: &mut DbConnection) -> std::result::Result<(), rusqlite::Error> {
        self.inner.is_valid(&mut conn.conn)
    }

    fn has_broken(&self, conn: &mut DbConnection) -> bool {
        if conn.broken {
            warn!("Discarding broken database connection");
            return true;
        }
        if !conn.conn.is_autocommit() {
            warn!("Discarding database connection left inside a transaction");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open(path: &Path, size: usize) -> Result<Pool> {
        create_pool(path, size, Duration::from_secs(1), Duration::from_millis(500))
    }

    #[test]
    fn test_connections_have_foreign_keys() -> Result<()> {
        let dir = tempdir()?;
        let pool = open(&dir.path().join("db.sqlite"), 2)?;
        let conn = checkout(&pool)?;
        let enabled: bool = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?;
        assert!(enabled);
        Ok(())
    }

    #[test]
    fn test_discarded_connection_is_replaced() -> Result<()> {
        let dir = tempdir()?;
        let pool = open(&dir.path().join("db.sqlite"), 1)?;
        {
            let mut conn = checkout(&pool)?;
            conn.discard();
        }
        let conn = checkout(&pool)?;
        let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
        assert_eq!(one, 1);
        Ok(())
    }

    #[test]
    fn test_connection_left_in_transaction_is_not_reused() -> Result<()> {
        let dir = tempdir()?;
        let pool = open(&dir.path().join("db.sqlite"), 1)?;
        {
            let conn = checkout(&pool)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        let conn = checkout(&pool)?;
        assert!(conn.is_autocommit());
        Ok(())
    }

    #[test]
    fn test_waits_for_returned_connection() -> Result<()> {
        let dir = tempdir()?;
        let pool = Arc::new(create_pool(
            &dir.path().join("db.sqlite"),
            1,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )?);
        let held = checkout(&pool)?;

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || checkout(&pool).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
        Ok(())
    }

    #[test]
    fn test_exhausted_pool_times_out_as_fatal() -> Result<()> {
        let dir = tempdir()?;
        let pool = open(&dir.path().join("db.sqlite"), 1)?;
        let _held = checkout(&pool)?;
        let err = checkout(&pool).map(|_| ()).unwrap_err();
        assert!(crate::error::is_fatal(&err));
        Ok(())
    }
}
