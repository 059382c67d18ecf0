//! Store failure taxonomy.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of a store operation. "Not found" is never an error; reads return
/// `Option` instead.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or was busy. Safe to retry.
    #[error("store unavailable during {op}: {source}")]
    Unavailable {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The store rejected the operation.
    #[error("store query failed during {op}: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A stored document could not be decoded or encoded.
    #[error("malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Classify a driver error raised while running `op`.
    pub fn from_sqlx(op: &'static str, source: sqlx::Error) -> Self {
        if is_transient(&source) {
            StoreError::Unavailable { op, source }
        } else {
            StoreError::Query { op, source }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY (5) / SQLITE_LOCKED (6), including extended codes.
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|c| matches!(c & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}
