//! Error types for the data layer.
//!
//! All store and pool operations return [`DbError`]. The variants split into
//! two families that callers treat differently:
//!
//! - **transient** ([`DbError::PoolExhausted`], [`DbError::Connection`]):
//!   the database was unreachable or saturated; retrying later may succeed.
//! - **integrity** (everything else): the data itself is wrong or stale;
//!   retrying the same operation will fail the same way.
//!
//! An absent record is not an error. `load` returns `Ok(None)`.

use playervault_types::PlayerId;

use crate::codec::CodecError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No connection could be leased before the acquire timeout elapsed.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// A transient network or database failure.
    #[error("database connection error: {0}")]
    Connection(String),

    /// The stored version stamp advanced since the record was loaded.
    #[error("version conflict for player {player}: expected {expected}, stored {actual:?}")]
    Conflict {
        /// The record that failed to save.
        player: PlayerId,
        /// The version the caller based its write on.
        expected: u64,
        /// The version currently stored, or `None` if the row is gone.
        actual: Option<u64>,
    },

    /// Stored data could not be decoded.
    #[error("malformed stored data: {0}")]
    Decode(String),

    /// A record's schema version is incompatible with this build.
    #[error("schema mismatch for player {player}: stored {stored}, offered {offered}")]
    SchemaMismatch {
        /// The affected record.
        player: PlayerId,
        /// Schema version found in the store.
        stored: u32,
        /// Schema version offered by the caller or supported by this build.
        offered: u32,
    },

    /// Any other database failure (constraint violation, bad SQL).
    #[error("database error: {0}")]
    Database(String),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Name used by the record store contract for its error taxonomy.
pub type StoreError = DbError;

impl DbError {
    /// Whether the operation may succeed if retried later.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::Connection(_))
    }

    /// Whether this is an optimistic-concurrency violation.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<CodecError> for DbError {
    fn from(err: CodecError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// SQLSTATE classes and codes that indicate a retryable condition.
///
/// Class `08` is connection exception, `57P0x` are operator interventions
/// (admin shutdown, crash shutdown, cannot connect now), `40001`/`40P01` are
/// serialization failure and deadlock.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("57P")
        || code == "40001"
        || code == "40P01"
        || code == "53300"
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                Self::PoolExhausted(String::from("timed out waiting for a connection"))
            }
            sqlx::Error::PoolClosed => Self::Connection(String::from("pool is closed")),
            sqlx::Error::Io(e) => Self::Connection(format!("I/O: {e}")),
            sqlx::Error::Tls(e) => Self::Connection(format!("TLS: {e}")),
            sqlx::Error::Protocol(msg) => Self::Connection(format!("protocol: {msg}")),
            sqlx::Error::WorkerCrashed => Self::Connection(String::from("worker crashed")),
            sqlx::Error::Configuration(e) => Self::Config(e.to_string()),
            sqlx::Error::Database(db_err) => {
                let transient = db_err.code().is_some_and(|code| is_transient_sqlstate(&code));
                if transient {
                    Self::Connection(db_err.to_string())
                } else {
                    Self::Database(db_err.to_string())
                }
            }
            e @ (sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. }) => Self::Decode(e.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DbError::PoolExhausted(String::from("busy")).is_transient());
        assert!(DbError::Connection(String::from("refused")).is_transient());
        assert!(!DbError::Decode(String::from("bad base64")).is_transient());
        assert!(
            !DbError::Conflict {
                player: PlayerId::new(),
                expected: 1,
                actual: Some(2),
            }
            .is_transient()
        );
    }

    #[test]
    fn sqlx_pool_errors_map_to_transient_variants() {
        assert!(matches!(
            DbError::from(sqlx::Error::PoolTimedOut),
            DbError::PoolExhausted(_)
        ));
        assert!(matches!(
            DbError::from(sqlx::Error::PoolClosed),
            DbError::Connection(_)
        ));
        assert!(matches!(
            DbError::from(sqlx::Error::RowNotFound),
            DbError::Database(_)
        ));
    }

    #[test]
    fn sqlstate_classes() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(is_transient_sqlstate("40001"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
    }

    #[test]
    fn conflict_display_names_versions() {
        let err = DbError::Conflict {
            player: PlayerId::new(),
            expected: 1,
            actual: Some(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 1"));
        assert!(msg.contains("Some(2)"));
        assert!(err.is_conflict());
    }
}
