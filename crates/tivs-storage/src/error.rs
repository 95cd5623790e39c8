use thiserror::Error;
use tivs_core::{PortalId, RunId, RunStatus, UnknownVariant};

/// SQLite primary result codes that mean "another writer got there first".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown portal {0}")]
    UnknownPortal(PortalId),
    #[error("portal slug `{0}` is already registered")]
    DuplicateSlug(String),
    #[error("portal `{0}` not found")]
    PortalNotFound(String),
    #[error("unknown run {0}")]
    UnknownRun(RunId),
    #[error("run {run_id} is already finalized as {status}")]
    RunAlreadyFinalized { run_id: RunId, status: RunStatus },
    #[error("write conflict on tender `{key}` after {attempts} attempts")]
    WriteConflict { key: String, attempts: usize },
    #[error("backup failed: {0}")]
    BackupFailure(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        Self::InvalidData(err.to_string())
    }
}

impl StoreError {
    /// Lock contention from a concurrent writer; the unit of work can be replayed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Another writer inserted the same unique key first; replaying the unit
    /// of work takes the update path instead.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::Database(db_err)) if db_err.is_unique_violation())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
