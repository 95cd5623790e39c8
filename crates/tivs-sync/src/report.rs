//! Per-run JSON reports. Counts and identifiers only, never record contents.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tivs_core::{RunCounts, RunId, RunStatus};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub portal: String,
    pub scope: String,
    pub batch_id: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub created: u64,
    pub transitions: u64,
    /// Closed tenders this run's full listing no longer showed.
    pub archived_unseen: u64,
    pub aborted: bool,
}

pub fn report_path(dir: &Path, run_id: RunId) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}

pub async fn write_run_report(dir: &Path, report: &RunReport) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = report_path(dir, report.run_id);
    let temp_path = dir.join(format!(".{}.json.tmp", report.run_id));
    let body = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&temp_path, body)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    fs::rename(&temp_path, &path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(path)
}

pub async fn read_run_report(dir: &Path, run_id: RunId) -> Result<RunReport> {
    let path = report_path(dir, run_id);
    let body = fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn written_report_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let report = RunReport {
            run_id: 42,
            portal: "hp".into(),
            scope: "all".into(),
            batch_id: Some("batch_0001.json".into()),
            status: RunStatus::Partial,
            started_at: Utc.with_ymd_and_hms(2026, 5, 1, 4, 0, 0).unwrap(),
            completed_at: None,
            counts: RunCounts {
                expected: 4,
                extracted: 3,
                skipped: 1,
                errors: 0,
            },
            created: 3,
            transitions: 3,
            archived_unseen: 0,
            aborted: false,
        };

        let path = write_run_report(dir.path(), &report).await.unwrap();
        assert!(path.ends_with("42.json"));
        assert_eq!(read_run_report(dir.path(), 42).await.unwrap(), report);
    }
}
