//! Run ledger: one lifecycle row per harvesting pass.

use tivs_core::{PortalId, RunCounts, RunId, RunOutcome, RunStatus, ScrapeRun};
use tracing::info;

use crate::rows::run_from_row;
use crate::{encode_ts, store_now, StoreError, StoreResult, TenderStore};

const RUN_COLUMNS: &str = "id, portal_id, scope, status, started_at, completed_at, expected_count, \
     extracted_count, skipped_count, error_count, output_ref, notes";

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl TenderStore {
    /// Open a run in `running` with zero counts.
    pub async fn start_run(&self, portal_id: PortalId, scope: &str) -> StoreResult<RunId> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM portals WHERE id = ?")
            .bind(portal_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownPortal(portal_id));
        }

        let done = sqlx::query(
            "INSERT INTO scrape_runs (portal_id, scope, status, started_at) VALUES (?, ?, 'running', ?)",
        )
        .bind(portal_id)
        .bind(scope)
        .bind(encode_ts(store_now()))
        .execute(&self.pool)
        .await?;
        let run_id = done.last_insert_rowid();
        info!(run_id, portal_id, scope, "run started");
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: RunId) -> StoreResult<ScrapeRun> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM scrape_runs WHERE id = ?"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UnknownRun(run_id))?;
        run_from_row(&row)
    }

    pub async fn runs_for_portal(&self, portal_id: PortalId, limit: u32) -> StoreResult<Vec<ScrapeRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM scrape_runs WHERE portal_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(portal_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Overwrite the run's counters. Only valid while the run is `running`.
    pub async fn record_progress(&self, run_id: RunId, counts: RunCounts) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET expected_count = ?, extracted_count = ?, skipped_count = ?, error_count = ?
             WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(to_i64(counts.expected))
        .bind(to_i64(counts.extracted))
        .bind(to_i64(counts.skipped))
        .bind(to_i64(counts.errors))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(self.not_running(run_id).await);
        }
        Ok(())
    }

    /// Attach the artifact produced by the run (e.g. a raw dump path).
    pub async fn set_run_output(&self, run_id: RunId, output_ref: &str) -> StoreResult<()> {
        let done = sqlx::query("UPDATE scrape_runs SET output_ref = ? WHERE id = ? AND status = 'running'")
            .bind(output_ref)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(self.not_running(run_id).await);
        }
        Ok(())
    }

    /// Move a running run into its terminal state. A single conditional
    /// update, so exactly one caller can ever succeed.
    pub async fn finalize_run(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
        notes: Option<&str>,
    ) -> StoreResult<ScrapeRun> {
        let done = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = ?, completed_at = ?, notes = COALESCE(?, notes)
             WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(RunStatus::from(outcome).as_str())
        .bind(encode_ts(store_now()))
        .bind(notes)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(self.not_running(run_id).await);
        }
        let run = self.get_run(run_id).await?;
        info!(
            run_id,
            status = %run.status,
            extracted = run.counts.extracted,
            skipped = run.counts.skipped,
            errors = run.counts.errors,
            "run finalized"
        );
        Ok(run)
    }

    /// Error for a write against a run that is missing or terminal.
    async fn not_running(&self, run_id: RunId) -> StoreError {
        match self.get_run(run_id).await {
            Ok(run) => StoreError::RunAlreadyFinalized {
                run_id,
                status: run.status,
            },
            Err(err) => err,
        }
    }

    /// Load a run and require it to still be `running`.
    pub(crate) async fn running_run(&self, run_id: RunId) -> StoreResult<ScrapeRun> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(StoreError::RunAlreadyFinalized {
                run_id,
                status: run.status,
            });
        }
        Ok(run)
    }
}
