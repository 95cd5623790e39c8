//! Durable, versioned tender store over SQLite.
//!
//! One [`TenderStore`] handle owns the connection pool and is passed to every
//! component that reads or writes; there is no ambient "current database".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tivs_core::StatusPolicy;
use tracing::info;

pub mod backup;
mod error;
pub mod index;
pub mod integrity;
pub mod locks;
pub mod portals;
pub mod query;
mod rows;
pub mod runs;
pub mod upsert;

pub use backup::{BackupCopy, RetentionPolicy};
pub use error::{StoreError, StoreResult};
pub use index::{CanonicalWriteHook, SearchIndexHook};
pub use integrity::IntegrityReport;
pub use locks::{KeyedLocks, TenderKey};
pub use query::{Page, Partition, PortalHealth, TenderDetail, TenderQuery};
pub use upsert::{AbortSignal, BatchReport, RecordOutcome};

pub const CRATE_NAME: &str = "tivs-storage";

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub status_policy: StatusPolicy,
    pub backoff: BackoffPolicy,
}

impl StoreOptions {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            status_policy: StatusPolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_status_policy(mut self, policy: StatusPolicy) -> Self {
        self.status_policy = policy;
        self
    }
}

#[derive(Clone)]
pub struct TenderStore {
    pool: SqlitePool,
    options: Arc<StoreOptions>,
    locks: KeyedLocks,
    hooks: Arc<Vec<Arc<dyn CanonicalWriteHook>>>,
}

impl TenderStore {
    /// Open (creating if needed) the database file and apply pending migrations.
    pub async fn open(options: StoreOptions) -> StoreResult<Self> {
        if let Some(parent) = options.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connect = SqliteConnectOptions::new()
            .filename(&options.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await?;

        let store = Self {
            pool,
            options: Arc::new(options),
            locks: KeyedLocks::new(),
            hooks: Arc::new(vec![Arc::new(SearchIndexHook) as Arc<dyn CanonicalWriteHook>]),
        };
        store.migrate().await?;
        info!(path = %store.options.database_path.display(), "tender store opened");
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn database_path(&self) -> &Path {
        &self.options.database_path
    }
}

/// Wall clock at the precision timestamps are stored with.
pub fn store_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC text so stored timestamps sort lexicographically.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::InvalidData(format!("timestamp `{text}`: {err}")))
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn timestamps_are_fixed_width_and_round_trip() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).single().unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        let (ea, eb) = (encode_ts(a), encode_ts(b));
        assert_eq!(ea, "2026-03-01T09:05:00.000000Z");
        assert_eq!(ea.len(), eb.len());
        assert!(ea < eb);
        assert_eq!(decode_ts(&eb).unwrap(), b);
    }

    #[tokio::test]
    async fn open_is_idempotent_over_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tenders.db");
        let store = TenderStore::open(StoreOptions::new(&path)).await.unwrap();
        store.close().await;
        let reopened = TenderStore::open(StoreOptions::new(&path)).await.unwrap();
        assert_eq!(reopened.database_path(), path.as_path());
    }
}
