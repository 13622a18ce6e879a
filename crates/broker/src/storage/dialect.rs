//! Per-backend SQL differences
//!
//! Only SQLite is opened by the store; the other dialects are rendered so the
//! query layer stays portable and their SQL can be checked in tests.

use rusqlite::Connection;
use anyhow::Result;

use super::query::{SqlValue, Statement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    PostgreSql,
    MySql,
}

/// Logical column types used by schema definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-incrementing primary key
    Serial,
    Integer,
    BigInt,
    Boolean,
    Text,
    Blob,
    DateTime,
}

impl Dialect {
    /// Positional parameter marker, 1-based
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::PostgreSql => format!("${}", index),
            Dialect::MySql => "?".to_string(),
        }
    }

    pub fn type_name(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (Dialect::Sqlite, ColumnType::Serial) => "INTEGER PRIMARY KEY AUTOINCREMENT",
            (Dialect::PostgreSql, ColumnType::Serial) => "BIGSERIAL PRIMARY KEY",
            (Dialect::MySql, ColumnType::Serial) => "BIGINT PRIMARY KEY AUTO_INCREMENT",
            (Dialect::Sqlite, ColumnType::Integer | ColumnType::BigInt | ColumnType::Boolean) => {
                "INTEGER"
            }
            (_, ColumnType::Integer) => "INTEGER",
            (_, ColumnType::BigInt) => "BIGINT",
            (Dialect::PostgreSql, ColumnType::Boolean) => "BOOLEAN",
            (Dialect::MySql, ColumnType::Boolean) => "TINYINT(1)",
            (Dialect::MySql, ColumnType::Text) => "VARCHAR(255)",
            (_, ColumnType::Text) => "TEXT",
            (Dialect::PostgreSql, ColumnType::Blob) => "BYTEA",
            (Dialect::MySql, ColumnType::Blob) => "LONGBLOB",
            (Dialect::Sqlite, ColumnType::Blob) => "BLOB",
            (Dialect::PostgreSql, ColumnType::DateTime) => "TIMESTAMP",
            (Dialect::MySql, ColumnType::DateTime) => "DATETIME",
            (Dialect::Sqlite, ColumnType::DateTime) => "TEXT",
        }
    }

    /// Inline a string literal
    pub fn quote_literal(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 2);
        out.push('\'');
        for c in text.chars() {
            match c {
                '\'' => out.push_str("''"),
                '\\' if *self == Dialect::MySql => out.push_str("\\\\"),
                c => out.push(c),
            }
        }
        out.push('\'');
        out
    }

    pub fn supports_for_update(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Query answering whether `table` exists; returns a count
    pub fn has_table_query(&self, table: &str) -> Statement {
        let sql = match self {
            Dialect::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1".to_string()
            }
            Dialect::PostgreSql => {
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1".to_string()
            }
            Dialect::MySql => "SELECT COUNT(*) FROM information_schema.tables \
                               WHERE table_schema = DATABASE() AND table_name = ?"
                .to_string(),
        };
        Statement {
            sql,
            params: vec![SqlValue::from(table)],
        }
    }

    /// Query answering whether `index` exists on `table`; returns a count
    pub fn has_index_query(&self, table: &str, index: &str) -> Statement {
        let sql = match self {
            Dialect::Sqlite => "SELECT COUNT(*) FROM sqlite_master \
                                WHERE type = 'index' AND tbl_name = ?1 AND name = ?2"
                .to_string(),
            Dialect::PostgreSql => {
                "SELECT COUNT(*) FROM pg_indexes WHERE tablename = $1 AND indexname = $2"
                    .to_string()
            }
            Dialect::MySql => "SELECT COUNT(*) FROM information_schema.statistics \
                               WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?"
                .to_string(),
        };
        Statement {
            sql,
            params: vec![SqlValue::from(table), SqlValue::from(index)],
        }
    }
}

/// Schema introspection over an open SQLite connection
pub struct Introspector<'a> {
    conn: &'a Connection,
    dialect: Dialect,
}

impl<'a> Introspector<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            dialect: Dialect::Sqlite,
        }
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        self.count(self.dialect.has_table_query(table))
    }

    pub fn has_index(&self, table: &str, index: &str) -> Result<bool> {
        self.count(self.dialect.has_index_query(table, index))
    }

    fn count(&self, stmt: Statement) -> Result<bool> {
        let rows = stmt.query(self.conn, |row| row.get::<_, i64>(0))?;
        Ok(rows.first().copied().unwrap_or(0) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::PostgreSql.placeholder(2), "$2");
        assert_eq!(Dialect::MySql.placeholder(2), "?");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(Dialect::Sqlite.quote_literal("it's"), "'it''s'");
        assert_eq!(Dialect::MySql.quote_literal("a\\b"), "'a\\\\b'");
        assert_eq!(Dialect::PostgreSql.quote_literal("a\\b"), "'a\\b'");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Dialect::Sqlite.type_name(ColumnType::Boolean), "INTEGER");
        assert_eq!(Dialect::PostgreSql.type_name(ColumnType::Blob), "BYTEA");
        assert_eq!(
            Dialect::MySql.type_name(ColumnType::Serial),
            "BIGINT PRIMARY KEY AUTO_INCREMENT"
        );
    }

    #[test]
    fn test_introspection() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER); CREATE INDEX t_a ON t (a);")
            .unwrap();
        let inspect = Introspector::new(&conn);
        assert!(inspect.has_table("t").unwrap());
        assert!(!inspect.has_table("missing").unwrap());
        assert!(inspect.has_index("t", "t_a").unwrap());
        assert!(!inspect.has_index("t", "t_b").unwrap());
    }
}
