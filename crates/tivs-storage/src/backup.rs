//! Tiered point-in-time copies of the store and their retention.
//!
//! Copies are taken with `VACUUM INTO`, which reads one consistent snapshot
//! and holds no write lock, into a temp file that is renamed into place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tivs_core::{BackupOutcome, BackupRecord, BackupTier};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::rows::backup_from_row;
use crate::{encode_ts, StoreError, StoreResult, TenderStore};

const FILE_PREFIX: &str = "tenders_";
const FILE_EXTENSION: &str = ".db";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily_days: u32,
    pub weekly_weeks: u32,
    pub monthly_months: u32,
    pub yearly_years: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: 7,
            weekly_weeks: 16,
            monthly_months: 24,
            yearly_years: 7,
        }
    }
}

impl RetentionPolicy {
    /// Copies in `tier` taken before this instant are outside the window.
    pub fn cutoff(&self, tier: BackupTier, now: DateTime<Utc>) -> DateTime<Utc> {
        let months_back = |months: u32| {
            now.checked_sub_months(Months::new(months))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        match tier {
            BackupTier::Daily => now - Duration::days(i64::from(self.daily_days)),
            BackupTier::Weekly => now - Duration::weeks(i64::from(self.weekly_weeks)),
            BackupTier::Monthly => months_back(self.monthly_months),
            BackupTier::Yearly => months_back(self.yearly_years.saturating_mul(12)),
        }
    }
}

/// Tiers a scheduled pass on `date` produces: daily always, weekly on
/// Sundays, monthly on the 1st, yearly on January 1st.
pub fn tiers_due(date: NaiveDate) -> Vec<BackupTier> {
    let mut tiers = vec![BackupTier::Daily];
    if date.weekday() == Weekday::Sun {
        tiers.push(BackupTier::Weekly);
    }
    if date.day() == 1 {
        tiers.push(BackupTier::Monthly);
        if date.month() == 1 {
            tiers.push(BackupTier::Yearly);
        }
    }
    tiers
}

pub fn backup_file_name(tier: BackupTier, taken_at: DateTime<Utc>) -> String {
    format!(
        "{FILE_PREFIX}{tier}_{}{FILE_EXTENSION}",
        taken_at.format(STAMP_FORMAT)
    )
}

pub fn parse_backup_file_name(name: &str) -> Option<(BackupTier, DateTime<Utc>)> {
    let body = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_EXTENSION)?;
    let (tier, stamp) = body.split_once('_')?;
    let tier = tier.parse().ok()?;
    let taken_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?.and_utc();
    Some((tier, taken_at))
}

/// `<root>/<tier>/tenders_<tier>_<stamp>.db`
pub fn backup_path(root: &Path, tier: BackupTier, taken_at: DateTime<Utc>) -> PathBuf {
    root.join(tier.as_str()).join(backup_file_name(tier, taken_at))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCopy {
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
}

/// Copies of one tier found on disk, oldest first.
pub async fn list_backups(root: &Path, tier: BackupTier) -> StoreResult<Vec<BackupCopy>> {
    let dir = root.join(tier.as_str());
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut copies = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some((found_tier, taken_at)) = name.to_str().and_then(parse_backup_file_name) else {
            continue;
        };
        if found_tier == tier {
            copies.push(BackupCopy {
                path: entry.path(),
                taken_at,
            });
        }
    }
    copies.sort_by_key(|copy| copy.taken_at);
    Ok(copies)
}

/// Copies outside the window, oldest first. The newest copy is never
/// selected, however old it is.
pub fn select_prunable(copies: &[BackupCopy], cutoff: DateTime<Utc>) -> Vec<BackupCopy> {
    let mut sorted = copies.to_vec();
    sorted.sort_by_key(|copy| copy.taken_at);
    sorted.pop();
    sorted.retain(|copy| copy.taken_at < cutoff);
    sorted
}

pub async fn sha256_file(path: &Path) -> StoreResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl TenderStore {
    /// Take one copy for `tier`. Every attempt is logged to `backup_records`;
    /// a failed attempt is returned as [`StoreError::BackupFailure`].
    pub async fn create_backup(
        &self,
        backup_root: &Path,
        tier: BackupTier,
        now: DateTime<Utc>,
    ) -> StoreResult<BackupRecord> {
        let destination = backup_path(backup_root, tier, now);
        match self.write_backup(&destination).await {
            Ok((sha256, bytes)) => {
                let detail = serde_json::json!({ "sha256": sha256, "bytes": bytes }).to_string();
                let record = self
                    .insert_backup_record(now, &destination, tier, BackupOutcome::Success, Some(&detail))
                    .await?;
                info!(tier = %tier, path = %destination.display(), bytes, "backup written");
                Ok(record)
            }
            Err(err) => {
                let message = match err {
                    StoreError::BackupFailure(message) => message,
                    other => other.to_string(),
                };
                warn!(tier = %tier, path = %destination.display(), error = %message, "backup failed");
                if let Err(log_err) = self
                    .insert_backup_record(now, &destination, tier, BackupOutcome::Failure, Some(&message))
                    .await
                {
                    warn!(error = %log_err, "could not record failed backup");
                }
                Err(StoreError::BackupFailure(message))
            }
        }
    }

    async fn write_backup(&self, destination: &Path) -> StoreResult<(String, u64)> {
        let parent = destination
            .parent()
            .ok_or_else(|| StoreError::BackupFailure(format!("{} has no parent", destination.display())))?;
        fs::create_dir_all(parent).await?;
        if fs::try_exists(destination).await? {
            return Err(StoreError::BackupFailure(format!(
                "{} already exists",
                destination.display()
            )));
        }

        let file_name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{file_name}.tmp"));
        if fs::try_exists(&temp_path).await? {
            fs::remove_file(&temp_path).await?;
        }

        let copied = sqlx::query("VACUUM INTO ?")
            .bind(temp_path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await;
        if let Err(err) = copied {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        let sha256 = sha256_file(&temp_path).await?;
        let bytes = fs::metadata(&temp_path).await?.len();
        fs::rename(&temp_path, destination).await?;
        Ok((sha256, bytes))
    }

    /// Delete copies outside each tier's window, logging one `pruned` row per
    /// deleted file.
    pub async fn prune_backups(
        &self,
        backup_root: &Path,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<BackupRecord>> {
        let mut pruned = Vec::new();
        for tier in BackupTier::ALL {
            let copies = list_backups(backup_root, tier).await?;
            for copy in select_prunable(&copies, policy.cutoff(tier, now)) {
                fs::remove_file(&copy.path).await?;
                let detail = format!("taken {}", encode_ts(copy.taken_at));
                pruned.push(
                    self.insert_backup_record(now, &copy.path, tier, BackupOutcome::Pruned, Some(&detail))
                        .await?,
                );
            }
        }
        if !pruned.is_empty() {
            info!(pruned = pruned.len(), "old backups pruned");
        }
        Ok(pruned)
    }

    /// Backup audit log, newest first.
    pub async fn backup_records(&self, limit: u32) -> StoreResult<Vec<BackupRecord>> {
        let rows = sqlx::query("SELECT * FROM backup_records ORDER BY id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(backup_from_row).collect()
    }

    async fn insert_backup_record(
        &self,
        backup_date: DateTime<Utc>,
        destination: &Path,
        tier: BackupTier,
        outcome: BackupOutcome,
        detail: Option<&str>,
    ) -> StoreResult<BackupRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO backup_records (backup_date, source_path, destination_path, tier, outcome, detail)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(encode_ts(backup_date))
        .bind(self.database_path().display().to_string())
        .bind(destination.display().to_string())
        .bind(tier.as_str())
        .bind(outcome.as_str())
        .bind(detail)
        .fetch_one(&self.pool)
        .await?;
        backup_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_store;
    use crate::{StoreOptions, TenderStore};
    use chrono::TimeZone;
    use tivs_core::RawRecord;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 2, 30, 0).single().unwrap()
    }

    fn copy(taken_at: DateTime<Utc>) -> BackupCopy {
        BackupCopy {
            path: PathBuf::from(backup_file_name(BackupTier::Daily, taken_at)),
            taken_at,
        }
    }

    #[test]
    fn tiers_follow_the_calendar() {
        let ymd = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(tiers_due(ymd(2026, 6, 3)), vec![BackupTier::Daily]);
        assert_eq!(tiers_due(ymd(2026, 6, 7)), vec![BackupTier::Daily, BackupTier::Weekly]);
        assert_eq!(tiers_due(ymd(2026, 7, 1)), vec![BackupTier::Daily, BackupTier::Monthly]);
        // 2023-01-01 was a Sunday.
        assert_eq!(tiers_due(ymd(2023, 1, 1)), BackupTier::ALL.to_vec());
    }

    #[test]
    fn file_names_carry_tier_and_timestamp() {
        let taken = at(2026, 6, 1);
        let name = backup_file_name(BackupTier::Monthly, taken);
        assert_eq!(name, "tenders_monthly_20260601_023000.db");
        assert_eq!(parse_backup_file_name(&name), Some((BackupTier::Monthly, taken)));
        assert_eq!(parse_backup_file_name("notes.txt"), None);
        assert_eq!(parse_backup_file_name(".tenders_daily_20260601_023000.db.tmp"), None);
    }

    #[test]
    fn cutoffs_per_tier() {
        let policy = RetentionPolicy::default();
        let now = at(2026, 6, 1);
        assert_eq!(policy.cutoff(BackupTier::Daily, now), at(2026, 5, 25));
        assert_eq!(policy.cutoff(BackupTier::Monthly, now), at(2024, 6, 1));
        assert_eq!(policy.cutoff(BackupTier::Yearly, now), at(2019, 6, 1));
    }

    #[test]
    fn pruning_is_oldest_first_and_keeps_newest() {
        let copies = vec![copy(at(2026, 5, 1)), copy(at(2026, 4, 1)), copy(at(2026, 5, 30))];
        let prunable = select_prunable(&copies, at(2026, 5, 25));
        assert_eq!(
            prunable.iter().map(|c| c.taken_at).collect::<Vec<_>>(),
            vec![at(2026, 4, 1), at(2026, 5, 1)]
        );

        let stale_only = vec![copy(at(2020, 1, 1)), copy(at(2021, 1, 1))];
        let prunable = select_prunable(&stale_only, at(2026, 5, 25));
        assert_eq!(prunable, vec![copy(at(2020, 1, 1))]);
        assert!(select_prunable(&[], at(2026, 5, 25)).is_empty());
    }

    #[tokio::test]
    async fn backup_is_an_openable_consistent_copy() {
        let (dir, store) = temp_store().await;
        let portal = store.register_portal("hp", "HP", "https://a").await.unwrap();
        let run = store.start_run(portal, "all").await.unwrap();
        store
            .apply_batch(run, &[RawRecord::new().with("uid", "A").with("title", "Bridge")])
            .await
            .unwrap();

        let root = dir.path().join("backups");
        let record = store.create_backup(&root, BackupTier::Daily, at(2026, 6, 1)).await.unwrap();
        assert_eq!(record.outcome, BackupOutcome::Success);
        let detail: serde_json::Value = serde_json::from_str(record.detail.as_deref().unwrap()).unwrap();
        let path = PathBuf::from(&record.destination_path);
        assert_eq!(detail["sha256"].as_str().unwrap(), sha256_file(&path).await.unwrap());

        let copy = TenderStore::open(StoreOptions::new(&path)).await.unwrap();
        assert_eq!(copy.portal_health().await.unwrap()[0].total_tenders, 1);
        assert!(copy.verify_integrity().await.unwrap().is_clean());

        // Same tier and second again refuses to overwrite.
        let err = store.create_backup(&root, BackupTier::Daily, at(2026, 6, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::BackupFailure(_)));
        let log = store.backup_records(10).await.unwrap();
        assert_eq!(
            log.iter().map(|r| r.outcome).collect::<Vec<_>>(),
            vec![BackupOutcome::Failure, BackupOutcome::Success]
        );
    }

    #[tokio::test]
    async fn prune_deletes_stale_copies_and_logs_them() {
        let (dir, store) = temp_store().await;
        let root = dir.path().join("backups");
        for day in [1, 2, 20] {
            store
                .create_backup(&root, BackupTier::Daily, at(2026, 5, day))
                .await
                .unwrap();
        }

        let pruned = store
            .prune_backups(&root, &RetentionPolicy::default(), at(2026, 5, 21))
            .await
            .unwrap();
        assert_eq!(pruned.len(), 2);
        assert!(pruned.iter().all(|r| r.outcome == BackupOutcome::Pruned));

        let left = list_backups(&root, BackupTier::Daily).await.unwrap();
        assert_eq!(left.iter().map(|c| c.taken_at).collect::<Vec<_>>(), vec![at(2026, 5, 20)]);

        // Long after the window the single newest copy still survives.
        let pruned = store
            .prune_backups(&root, &RetentionPolicy::default(), at(2027, 1, 1))
            .await
            .unwrap();
        assert!(pruned.is_empty());
    }
}
