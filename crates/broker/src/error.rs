//! Broker error taxonomy
//!
//! Fallible code returns `anyhow::Result`. Failures that a client must be able
//! to tell apart are raised as [`BrokerError`] values and recovered at the
//! dispatcher with [`ErrorKind::classify`], which also maps raw backend errors.

use rusqlite::ErrorCode;

/// Typed failures surfaced to the originating command
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed command; the connection stays open
    #[error("{0}")]
    ProtocolSyntax(String),

    /// Duplicate name/remote id in scope, dangling reference or missing entity
    #[error("{0}")]
    StorageConstraint(String),

    /// The presented revision no longer matches the stored one
    #[error("{0}")]
    TransactionConflict(String),

    /// An adapter did not respond in time or is not connected
    #[error("{0}")]
    ResourceUnavailable(String),

    /// The storage backend connection is unusable
    #[error("{0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::ProtocolSyntax(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::StorageConstraint(msg.into())
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::StorageConstraint(format!("{} {} does not exist", what, id))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::TransactionConflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }
}

/// Coarse error classes, one per failure response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Constraint,
    Conflict,
    Unavailable,
    Fatal,
}

impl ErrorKind {
    /// Classify an error chain.
    ///
    /// Typed broker errors win; otherwise the first `rusqlite` error in the
    /// chain decides. Anything unrecognised is treated as a constraint failure
    /// so the transaction aborts and the message reaches the client.
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<BrokerError>() {
                return match e {
                    BrokerError::ProtocolSyntax(_) => Self::Syntax,
                    BrokerError::StorageConstraint(_) => Self::Constraint,
                    BrokerError::TransactionConflict(_) => Self::Conflict,
                    BrokerError::ResourceUnavailable(_) => Self::Unavailable,
                    BrokerError::Fatal(_) => Self::Fatal,
                };
            }
            if let Some(e) = cause.downcast_ref::<rusqlite::Error>() {
                return Self::from_sqlite(e);
            }
        }
        Self::Constraint
    }

    fn from_sqlite(err: &rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => Self::Constraint,
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::Conflict,
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly,
            ) => Self::Fatal,
            _ => Self::Constraint,
        }
    }

    /// Response code attached to `NO` responses
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Syntax => None,
            Self::Constraint => Some("CONSTRAINT"),
            Self::Conflict => Some("CONFLICT"),
            Self::Unavailable => Some("UNAVAILABLE"),
            Self::Fatal => Some("FATAL"),
        }
    }
}

/// True when the error means the backend connection must be discarded
pub fn is_fatal(err: &anyhow::Error) -> bool {
    ErrorKind::classify(err) == ErrorKind::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_typed_error_survives_context() {
        let err: anyhow::Result<()> = Err(BrokerError::conflict("stale revision").into());
        let err = err.context("STORE failed").unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Conflict);
    }

    #[test]
    fn test_sqlite_constraint_is_constraint() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert_eq!(ErrorKind::classify(&err.into()), ErrorKind::Constraint);
    }

    #[test]
    fn test_unknown_error_defaults_to_constraint() {
        let err = anyhow::anyhow!("something odd");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Constraint);
        assert!(!is_fatal(&err));
    }

    #[test]
    fn test_codes() {
        assert_eq!(ErrorKind::Syntax.code(), None);
        assert_eq!(ErrorKind::Fatal.code(), Some("FATAL"));
    }
}
