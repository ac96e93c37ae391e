#![forbid(unsafe_code)]

mod catalog;
mod error;
mod query;
mod reconcile;
mod requests;
mod schema;
mod validate;

pub use error::IndexError;
pub use query::{GroupBy, OccurrenceQuery, QueryResults, RowMode};
pub use reconcile::{DefinitionKind, InconsistencyReason, LogInconsistency, ReconcileReport};
pub use requests::*;
pub use validate::{DocumentMismatch, FrequencyMismatch, IndexStats, ValidationReport, VertexRef};

use crate::config::IndexConfig;
use crate::locks::{TagsetLockGuard, TagsetLocks};
use ag_core::ids::{
    CollectionId, DocumentId, IdError, PropertyDefinitionId, TagDefinitionId, TagInstanceId,
    TagsetId,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// SQLite-backed definition catalog plus the derived occurrence graph.
///
/// Writes go through one connection guarded by a mutex and are additionally
/// serialized per tagset by [`TagsetLocks`]. Every query opens its own
/// read-only connection, so readers see committed snapshots only.
#[derive(Debug)]
pub struct OccurrenceIndex {
    writer: Mutex<Connection>,
    config: IndexConfig,
    db_path: PathBuf,
    locks: TagsetLocks,
}

impl OccurrenceIndex {
    pub fn open(config: IndexConfig) -> Result<Self, IndexError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let db_path = config.db_path();

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(config.busy_timeout())?;
        let mode = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        schema::install(&conn, config.grouping)?;
        info!(
            path = %db_path.display(),
            journal_mode = %mode,
            grouping = %config.grouping,
            "occurrence index opened"
        );

        Ok(Self {
            writer: Mutex::new(conn),
            config,
            db_path,
            locks: TagsetLocks::new(),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Holds the tagset's write lock, waiting at most `lock_wait_ms`.
    pub fn lock_tagset(&self, tagset: TagsetId) -> Result<TagsetLockGuard<'_>, IndexError> {
        self.locks.acquire(tagset, self.config.lock_wait())
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `body` in one immediate write transaction; any error rolls it back.
    fn write<T, F>(&self, body: F) -> Result<T, IndexError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, IndexError>,
    {
        let mut conn = self.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = body(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs `body` against a fresh read-only connection inside one read
    /// transaction, so every statement sees the same committed state.
    fn read_snapshot<T, F>(&self, body: F) -> Result<T, IndexError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, IndexError>,
    {
        let mut conn = Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(self.config.busy_timeout())?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = body(&tx)?;
        tx.finish()?;
        Ok(out)
    }
}

pub(crate) trait BlobId: Sized {
    fn from_blob(bytes: &[u8]) -> Result<Self, IdError>;
    fn blob(&self) -> &[u8];
}

macro_rules! impl_blob_id {
    ($($name:ty),* $(,)?) => {
        $(
            impl BlobId for $name {
                fn from_blob(bytes: &[u8]) -> Result<Self, IdError> {
                    <$name>::try_from_slice(bytes)
                }

                fn blob(&self) -> &[u8] {
                    self.as_bytes()
                }
            }
        )*
    };
}

impl_blob_id!(
    TagsetId,
    TagDefinitionId,
    PropertyDefinitionId,
    CollectionId,
    DocumentId,
    TagInstanceId,
);

pub(crate) fn get_id<T: BlobId>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let bytes = row.get::<_, Vec<u8>>(idx)?;
    T::from_blob(&bytes)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(err)))
}

pub(crate) fn get_opt_id<T: BlobId>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<Vec<u8>>>(idx)? {
        None => Ok(None),
        Some(bytes) => T::from_blob(&bytes).map(Some).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(err))
        }),
    }
}

pub(crate) fn to_sqlite_i64(value: u64) -> Result<i64, IndexError> {
    i64::try_from(value).map_err(|_| IndexError::InvalidInput("numeric overflow"))
}

pub(crate) fn from_sqlite_u64(value: i64) -> Result<u64, IndexError> {
    u64::try_from(value).map_err(|_| IndexError::CorruptRow("negative integer column"))
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
