//! Batch ingestion: one run per harvested batch, applied record by record.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tivs_core::{RunCounts, RunId, RunOutcome, RunStatus};
use tivs_intake::{BatchSource, HarvestBatch};
use tivs_storage::{store_now, AbortSignal, BatchReport, TenderStore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::report::{write_run_report, RunReport};

/// Records applied between two progress updates on the run row.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub runs: Vec<RunReport>,
    pub failed_sources: Vec<String>,
    pub archived_expired: u64,
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: TenderStore,
    reports_dir: Option<PathBuf>,
    chunk_size: usize,
}

impl IngestPipeline {
    pub fn new(store: TenderStore) -> Self {
        Self {
            store,
            reports_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn store(&self) -> &TenderStore {
        &self.store
    }

    /// Open a run for `batch`, apply it, finalize the run and write its report.
    ///
    /// Record-level problems only show up in the counts. An `Err` means the
    /// run could not be driven at all; the run is then finalized as failed.
    pub async fn ingest(
        &self,
        batch: &HarvestBatch,
        batch_id: Option<&str>,
        abort: &AbortSignal,
    ) -> Result<RunReport> {
        let portal = self
            .store
            .get_portal(&batch.portal)
            .await
            .with_context(|| format!("resolving portal `{}`", batch.portal))?;
        let run_id = self.store.start_run(portal.id, &batch.scope).await?;
        let span = info_span!("ingest_run", run_id, portal = %portal.slug, scope = %batch.scope);

        self.run_batch(run_id, &portal.slug, batch, batch_id, abort)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        run_id: RunId,
        portal: &str,
        batch: &HarvestBatch,
        batch_id: Option<&str>,
        abort: &AbortSignal,
    ) -> Result<RunReport> {
        let (counts, totals) = match self.drive_run(run_id, batch, batch_id, abort).await {
            Ok(progress) => progress,
            Err(err) => {
                let note = format!("ingestion stopped: {err:#}");
                if let Err(finalize_err) = self
                    .store
                    .finalize_run(run_id, RunOutcome::Failed, Some(&note))
                    .await
                {
                    warn!(error = %finalize_err, "could not mark run failed");
                }
                return Err(err);
            }
        };

        let outcome = RunOutcome::suggest(&counts, totals.aborted);
        let notes = run_notes(batch, &totals);
        let run = self.store.finalize_run(run_id, outcome, notes.as_deref()).await?;

        let archived_unseen = if run.status == RunStatus::Completed && !batch.records.is_empty() {
            self.store.sweep_unseen(run_id).await?
        } else {
            0
        };

        let report = RunReport {
            run_id,
            portal: portal.to_string(),
            scope: run.scope.clone(),
            batch_id: batch_id.map(str::to_string),
            status: run.status,
            started_at: run.started_at,
            completed_at: run.completed_at,
            counts: run.counts,
            created: totals.created,
            transitions: totals.transitions,
            archived_unseen,
            aborted: totals.aborted,
        };
        if let Some(dir) = &self.reports_dir {
            write_run_report(dir, &report).await?;
        }
        info!(status = %report.status, created = report.created, "batch ingested");
        Ok(report)
    }

    async fn drive_run(
        &self,
        run_id: RunId,
        batch: &HarvestBatch,
        batch_id: Option<&str>,
        abort: &AbortSignal,
    ) -> Result<(RunCounts, BatchReport)> {
        let mut counts = RunCounts {
            expected: batch.expected_count(),
            ..RunCounts::default()
        };
        self.store.record_progress(run_id, counts).await?;
        if let Some(id) = batch_id {
            self.store.set_run_output(run_id, id).await?;
        }

        let mut totals = BatchReport::default();
        for chunk in batch.records.chunks(self.chunk_size) {
            let report = self.store.apply_batch_until(run_id, chunk, abort).await?;
            totals.received += report.received;
            totals.applied += report.applied;
            totals.created += report.created;
            totals.transitions += report.transitions;
            totals.skipped += report.skipped;
            totals.errors += report.errors;
            totals.error_messages.extend(report.error_messages);
            totals.aborted |= report.aborted;

            counts.extracted = totals.applied;
            counts.skipped = totals.skipped;
            counts.errors = totals.errors;
            self.store.record_progress(run_id, counts).await?;
            if totals.aborted {
                break;
            }
        }
        if abort.is_aborted() {
            totals.aborted = true;
        }
        Ok((counts, totals))
    }

    /// Ingest every pending batch of `source`, acknowledging each one that
    /// produced a usable run. Failed runs stay pending for the next pass.
    pub async fn ingest_source(&self, source: &dyn BatchSource, abort: &AbortSignal) -> Result<Vec<RunReport>> {
        let slug = source.portal_slug();
        let portal = self.store.get_portal(slug).await?;
        if !portal.is_active {
            info!(portal = slug, "portal inactive, skipping its batches");
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        for pending in source.pending().await? {
            if abort.is_aborted() {
                break;
            }
            let report = self.ingest(&pending.batch, Some(pending.id.as_str()), abort).await?;
            if report.status != RunStatus::Failed {
                source.acknowledge(&pending.id).await?;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// One worker per source; a source that errors does not stop the others.
    /// Expired closed tenders are archived once every worker is done.
    pub async fn sync_all(&self, sources: Vec<Arc<dyn BatchSource>>, abort: &AbortSignal) -> Result<SyncRunSummary> {
        let started_at = store_now();
        let source_count = sources.len();
        let mut workers = JoinSet::new();
        for source in sources {
            let pipeline = self.clone();
            let abort = abort.clone();
            workers.spawn(async move {
                let slug = source.portal_slug().to_string();
                let result = pipeline.ingest_source(source.as_ref(), &abort).await;
                (slug, result)
            });
        }

        let mut runs = Vec::new();
        let mut failed_sources = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(reports))) => runs.extend(reports),
                Ok((slug, Err(err))) => {
                    let message = format!("{err:#}");
                    warn!(portal = %slug, error = %message, "source ingestion failed");
                    failed_sources.push(slug);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "ingestion worker panicked");
                    failed_sources.push("<worker>".to_string());
                }
            }
        }
        runs.sort_by_key(|report| report.run_id);
        failed_sources.sort();

        let archived_expired = self.store.archive_expired(store_now()).await?;
        let summary = SyncRunSummary {
            started_at,
            finished_at: store_now(),
            sources: source_count,
            runs,
            failed_sources,
            archived_expired,
        };
        info!(
            sources = summary.sources,
            runs = summary.runs.len(),
            failed = summary.failed_sources.len(),
            archived = summary.archived_expired,
            "sync pass finished"
        );
        Ok(summary)
    }
}

fn run_notes(batch: &HarvestBatch, totals: &BatchReport) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(notes) = batch.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        parts.push(notes.trim().to_string());
    }
    if totals.skipped > 0 {
        parts.push(format!("{} record(s) skipped", totals.skipped));
    }
    if let Some(first) = totals.error_messages.first() {
        parts.push(format!("{} error(s), first: {first}", totals.errors));
    }
    if totals.aborted {
        parts.push("aborted".to_string());
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}
