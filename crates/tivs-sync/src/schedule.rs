//! Scheduled maintenance: tiered backups, retention pruning and expiry archiving.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tivs_core::{BackupRecord, BackupTier};
use tivs_storage::backup::tiers_due;
use tivs_storage::{store_now, RetentionPolicy, TenderStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;

#[derive(Debug, Clone, Serialize)]
pub struct BackupPassSummary {
    pub taken: Vec<BackupRecord>,
    pub failed: Vec<(BackupTier, String)>,
    pub pruned: Vec<BackupRecord>,
    pub prune_error: Option<String>,
}

/// Take every tier due on `now`'s date, then prune all tiers.
///
/// A failed tier does not stop the remaining tiers or the pruning.
pub async fn run_backup_pass(
    store: &TenderStore,
    backup_root: &Path,
    retention: &RetentionPolicy,
    now: DateTime<Utc>,
) -> BackupPassSummary {
    let mut summary = BackupPassSummary {
        taken: Vec::new(),
        failed: Vec::new(),
        pruned: Vec::new(),
        prune_error: None,
    };

    for tier in tiers_due(now.date_naive()) {
        match store.create_backup(backup_root, tier, now).await {
            Ok(record) => summary.taken.push(record),
            Err(err) => {
                warn!(%tier, error = %err, "backup tier failed");
                summary.failed.push((tier, err.to_string()));
            }
        }
    }

    match store.prune_backups(backup_root, retention, now).await {
        Ok(pruned) => summary.pruned = pruned,
        Err(err) => {
            warn!(error = %err, "backup pruning failed");
            summary.prune_error = Some(err.to_string());
        }
    }

    info!(
        taken = summary.taken.len(),
        failed = summary.failed.len(),
        pruned = summary.pruned.len(),
        "backup pass finished"
    );
    summary
}

async fn maintenance_tick(store: &TenderStore, backup_root: &Path, retention: &RetentionPolicy) {
    let now = store_now();
    run_backup_pass(store, backup_root, retention, now).await;
    match store.archive_expired(now).await {
        Ok(archived) => info!(archived, "expired tenders archived"),
        Err(err) => warn!(error = %err, "archiving expired tenders failed"),
    }
}

/// Build (but do not start) the maintenance scheduler when it is enabled.
pub async fn maybe_build_scheduler(config: &SyncConfig, store: TenderStore) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let backup_root: PathBuf = config.backup_dir.clone();
    let retention = config.retention;
    let job = Job::new_async(config.backup_cron.as_str(), move |_uuid, _l| {
        let store = store.clone();
        let backup_root = backup_root.clone();
        Box::pin(async move {
            maintenance_tick(&store, &backup_root, &retention).await;
        })
    })
    .with_context(|| format!("invalid backup cron `{}`", config.backup_cron))?;
    scheduler.add(job).await.context("adding maintenance job")?;
    info!(cron = %config.backup_cron, "maintenance job scheduled");
    Ok(Some(scheduler))
}
