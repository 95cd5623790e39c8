//! Upsert & versioning engine.
//!
//! Every record is applied in its own short transaction: resolve the
//! canonical row, merge, recompute status, append the snapshot, run the
//! on-write hooks, commit. Writers are serialized per `(portal, uid)` key.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tivs_core::{
    compute_status, RawRecord, RunId, RunStatus, ScrapeRun, StatusInputs, TenderId, TenderItem,
    TenderRecord, TenderStatus,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::rows::{bind_fields, tender_from_row, FIELD_ASSIGNMENTS, FIELD_COLUMNS, FIELD_PLACEHOLDERS};
use crate::{encode_ts, store_now, StoreError, StoreResult, TenderKey, TenderStore};

/// Caller-owned cancellation flag for a batch in flight.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub received: u64,
    /// Records whose transaction committed.
    pub applied: u64,
    pub created: u64,
    pub transitions: u64,
    /// Malformed records rejected before any write.
    pub skipped: u64,
    /// Records whose transaction failed and was rolled back.
    pub errors: u64,
    pub error_messages: Vec<String>,
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub tender_id: TenderId,
    pub created: bool,
    pub old_status: Option<TenderStatus>,
    pub new_status: TenderStatus,
}

impl RecordOutcome {
    pub fn transitioned(&self) -> bool {
        self.old_status != Some(self.new_status)
    }
}

fn transition_reason(
    old: Option<TenderStatus>,
    new: TenderStatus,
    signal: Option<TenderStatus>,
) -> String {
    if signal == Some(new) && new != TenderStatus::Open {
        return format!("portal reported {new}");
    }
    match (old, new) {
        (None, _) => "first observation".to_string(),
        (Some(_), TenderStatus::Open) => "re-observed open".to_string(),
        (Some(_), TenderStatus::Closed) => "closing date passed".to_string(),
        (Some(_), TenderStatus::Archived) => "archive grace period elapsed".to_string(),
        (Some(_), TenderStatus::Cancelled) => "portal reported cancelled".to_string(),
    }
}

/// Move `item` into `next`, maintaining the lifecycle timestamps.
fn enter_status(item: &mut TenderItem, next: TenderStatus, now: DateTime<Utc>) {
    if next == TenderStatus::Open {
        item.closed_at = None;
        item.archived_at = None;
    } else if next.is_closed_family() {
        if !item.tender_status.is_closed_family() {
            item.closed_at = Some(now);
        }
        item.archived_at = None;
    } else if next == TenderStatus::Archived {
        item.closed_at.get_or_insert(now);
        item.archived_at = Some(now);
    }
    item.tender_status = next;
    item.is_live = next.is_live();
}

impl TenderStore {
    /// Apply an ordered batch of raw records under a running run.
    pub async fn apply_batch(&self, run_id: RunId, records: &[RawRecord]) -> StoreResult<BatchReport> {
        self.apply_batch_inner(run_id, records, &AbortSignal::new(), None)
            .await
    }

    /// Like [`apply_batch`](Self::apply_batch) with a fixed clock for the
    /// whole batch.
    pub async fn apply_batch_at(
        &self,
        run_id: RunId,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> StoreResult<BatchReport> {
        self.apply_batch_inner(run_id, records, &AbortSignal::new(), Some(now))
            .await
    }

    /// Apply records until `abort` is raised. Records already committed stay.
    pub async fn apply_batch_until(
        &self,
        run_id: RunId,
        records: &[RawRecord],
        abort: &AbortSignal,
    ) -> StoreResult<BatchReport> {
        self.apply_batch_inner(run_id, records, abort, None).await
    }

    async fn apply_batch_inner(
        &self,
        run_id: RunId,
        records: &[RawRecord],
        abort: &AbortSignal,
        clock: Option<DateTime<Utc>>,
    ) -> StoreResult<BatchReport> {
        let run = self.running_run(run_id).await?;
        let span = info_span!("apply_batch", run_id, portal_id = run.portal_id, records = records.len());

        async move {
            let mut report = BatchReport {
                received: records.len() as u64,
                ..Default::default()
            };

            for (position, raw) in records.iter().enumerate() {
                if abort.is_aborted() {
                    report.aborted = true;
                    warn!(position, "batch aborted by caller");
                    break;
                }

                let record = match TenderRecord::from_raw(raw) {
                    Ok(record) => record,
                    Err(err) => {
                        report.skipped += 1;
                        warn!(position, error = %err, "skipping malformed record");
                        continue;
                    }
                };

                let now = clock.unwrap_or_else(store_now);
                match self.apply_record(&run, &record, now).await {
                    Ok(outcome) => {
                        report.applied += 1;
                        report.created += u64::from(outcome.created);
                        report.transitions += u64::from(outcome.transitioned());
                    }
                    Err(err @ StoreError::RunAlreadyFinalized { .. }) => {
                        warn!(position, applied = report.applied, "run finalized while batch in flight");
                        return Err(err);
                    }
                    Err(err) => {
                        report.errors += 1;
                        warn!(position, uid = %record.portal_tender_uid, error = %err, "record rolled back");
                        report
                            .error_messages
                            .push(format!("{}: {err}", record.portal_tender_uid));
                    }
                }
            }

            info!(
                applied = report.applied,
                created = report.created,
                transitions = report.transitions,
                skipped = report.skipped,
                errors = report.errors,
                aborted = report.aborted,
                "batch applied"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Apply one validated record under the run, serialized on its key and
    /// replayed on write conflicts.
    pub async fn apply_record(
        &self,
        run: &ScrapeRun,
        record: &TenderRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome> {
        if run.status != RunStatus::Running {
            return Err(StoreError::RunAlreadyFinalized {
                run_id: run.id,
                status: run.status,
            });
        }
        let key = TenderKey::new(run.portal_id, &record.portal_tender_uid);
        self.with_key_retry(key, move || self.apply_record_once(run, record, now))
            .await
    }

    /// Run `op` holding the key's lock, replaying it with backoff while it
    /// loses to another writer.
    async fn with_key_retry<T, F, Fut>(&self, key: TenderKey, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let _guard = self.locks.lock(key.clone()).await;
        let backoff = self.options.backoff;
        let mut attempt = 0usize;
        loop {
            match op().await {
                Err(err) if err.is_retryable() || err.is_unique_violation() => {
                    if attempt >= backoff.max_retries {
                        return Err(StoreError::WriteConflict {
                            key: key.to_string(),
                            attempts: attempt + 1,
                        });
                    }
                    debug!(%key, attempt, error = %err, "write conflict, retrying");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn apply_record_once(
        &self,
        run: &ScrapeRun,
        record: &TenderRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome> {
        let policy = &self.options.status_policy;
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM scrape_runs WHERE id = ?")
            .bind(run.id)
            .fetch_optional(&mut *tx)
            .await?;
        let status: RunStatus = status.ok_or(StoreError::UnknownRun(run.id))?.parse()?;
        if status != RunStatus::Running {
            return Err(StoreError::RunAlreadyFinalized { run_id: run.id, status });
        }

        let existing = sqlx::query("SELECT * FROM tender_items WHERE portal_id = ? AND portal_tender_uid = ?")
            .bind(run.portal_id)
            .bind(record.portal_tender_uid.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| tender_from_row(&row))
            .transpose()?;

        let (item, outcome) = match existing {
            None => {
                let status = compute_status(
                    None,
                    &StatusInputs {
                        closing_at: record.fields.closing_at,
                        closed_at: None,
                        signal: record.status_signal,
                    },
                    now,
                    policy,
                );
                let mut item = TenderItem {
                    id: 0,
                    portal_id: run.portal_id,
                    portal_tender_uid: record.portal_tender_uid.clone(),
                    fields: record.fields.clone(),
                    is_live: status.is_live(),
                    tender_status: status,
                    first_seen_at: now,
                    last_seen_at: now,
                    closed_at: status.is_closed_family().then_some(now),
                    archived_at: None,
                    source_run_id: run.id,
                };
                item.id = insert_tender(&mut tx, &item).await?;
                let reason = transition_reason(None, status, record.status_signal);
                insert_transition(&mut tx, item.id, None, status, now, &reason, Some(run.id)).await?;
                let outcome = RecordOutcome {
                    tender_id: item.id,
                    created: true,
                    old_status: None,
                    new_status: status,
                };
                (item, outcome)
            }
            Some(mut item) => {
                item.fields.merge_from(&record.fields);
                let old = item.tender_status;
                let next = compute_status(
                    Some(old),
                    &StatusInputs {
                        closing_at: item.fields.closing_at,
                        closed_at: item.closed_at,
                        signal: record.status_signal,
                    },
                    now,
                    policy,
                );
                if next != old {
                    enter_status(&mut item, next, now);
                    let reason = transition_reason(Some(old), next, record.status_signal);
                    insert_transition(&mut tx, item.id, Some(old), next, now, &reason, Some(run.id))
                        .await?;
                }
                item.last_seen_at = now;
                item.source_run_id = run.id;
                update_tender(&mut tx, &item).await?;
                let outcome = RecordOutcome {
                    tender_id: item.id,
                    created: false,
                    old_status: Some(old),
                    new_status: next,
                };
                (item, outcome)
            }
        };

        insert_snapshot(&mut tx, &item, Some(run.id), now).await?;
        for hook in self.hooks.iter() {
            hook.on_write(&mut tx, &item).await?;
        }
        tx.commit().await?;

        if outcome.transitioned() {
            debug!(
                tender_id = item.id,
                uid = %item.portal_tender_uid,
                old = ?outcome.old_status,
                new = %outcome.new_status,
                "status transition"
            );
        }
        Ok(outcome)
    }

    /// After a completed `all`-scope run, archive the portal's closed-family
    /// tenders that the run did not observe. Returns the number archived.
    pub async fn sweep_unseen(&self, run_id: RunId) -> StoreResult<u64> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Completed || run.scope != "all" {
            debug!(run_id, status = %run.status, scope = %run.scope, "sweep skipped");
            return Ok(0);
        }

        let candidates: Vec<(TenderId, String)> = sqlx::query_as(
            r#"
            SELECT id, portal_tender_uid FROM tender_items
             WHERE portal_id = ?
               AND tender_status IN ('closed', 'cancelled')
               AND source_run_id <> ?
            "#,
        )
        .bind(run.portal_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let now = store_now();
        let mut archived = 0u64;
        for (tender_id, uid) in candidates {
            let key = TenderKey::new(run.portal_id, &uid);
            let moved = self
                .with_key_retry(key, move || {
                    self.restatus_once(tender_id, Some(run_id), now, "not seen in full listing", move |item| {
                        (item.tender_status.is_closed_family() && item.source_run_id != run_id)
                            .then_some(TenderStatus::Archived)
                    })
                })
                .await?;
            archived += u64::from(moved);
        }
        info!(run_id, archived, "unseen closed tenders archived");
        Ok(archived)
    }

    /// Archive closed-family tenders whose grace period has elapsed at `now`.
    pub async fn archive_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let candidates: Vec<(TenderId, i64, String)> = sqlx::query_as(
            "SELECT id, portal_id, portal_tender_uid FROM tender_items WHERE tender_status IN ('closed', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await?;

        let policy = self.options.status_policy;
        let mut archived = 0u64;
        for (tender_id, portal_id, uid) in candidates {
            let key = TenderKey::new(portal_id, &uid);
            let moved = self
                .with_key_retry(key, move || {
                    self.restatus_once(tender_id, None, now, "archive grace period elapsed", move |item| {
                        let next = compute_status(
                            Some(item.tender_status),
                            &StatusInputs {
                                closing_at: item.fields.closing_at,
                                closed_at: item.closed_at,
                                signal: None,
                            },
                            now,
                            &policy,
                        );
                        (next == TenderStatus::Archived).then_some(next)
                    })
                })
                .await?;
            archived += u64::from(moved);
        }
        if archived > 0 {
            info!(archived, "expired tenders archived");
        }
        Ok(archived)
    }

    /// Status-only change outside an observation. Fields are left alone; the
    /// snapshot records the new status so history and transitions agree.
    async fn restatus_once<D>(
        &self,
        tender_id: TenderId,
        run_id: Option<RunId>,
        now: DateTime<Utc>,
        reason: &str,
        decide: D,
    ) -> StoreResult<bool>
    where
        D: Fn(&TenderItem) -> Option<TenderStatus>,
    {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query("SELECT * FROM tender_items WHERE id = ?")
            .bind(tender_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };
        let mut item = tender_from_row(&row)?;
        let Some(next) = decide(&item).filter(|next| *next != item.tender_status) else {
            return Ok(false);
        };

        let old = item.tender_status;
        enter_status(&mut item, next, now);
        sqlx::query(
            "UPDATE tender_items SET tender_status = ?, is_live = ?, closed_at = ?, archived_at = ? WHERE id = ?",
        )
        .bind(item.tender_status.as_str())
        .bind(item.is_live)
        .bind(item.closed_at.map(encode_ts))
        .bind(item.archived_at.map(encode_ts))
        .bind(item.id)
        .execute(&mut *tx)
        .await?;
        insert_transition(&mut tx, item.id, Some(old), next, now, reason, run_id).await?;
        insert_snapshot(&mut tx, &item, run_id, now).await?;
        for hook in self.hooks.iter() {
            hook.on_write(&mut tx, &item).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Physically delete a tender with its history and derived rows.
    /// Not part of normal operation; archival only flips status.
    pub async fn purge_tender(&self, tender_id: TenderId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        for hook in self.hooks.iter() {
            hook.on_purge(&mut tx, tender_id).await?;
        }
        let done = sqlx::query("DELETE FROM tender_items WHERE id = ?")
            .bind(tender_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let purged = done.rows_affected() > 0;
        if purged {
            warn!(tender_id, "tender purged");
        }
        Ok(purged)
    }
}

async fn insert_tender(conn: &mut SqliteConnection, item: &TenderItem) -> StoreResult<TenderId> {
    let sql = format!(
        "INSERT INTO tender_items (portal_id, portal_tender_uid, {FIELD_COLUMNS}, tender_status, is_live, \
         first_seen_at, last_seen_at, closed_at, archived_at, source_run_id) \
         VALUES (?, ?, {FIELD_PLACEHOLDERS}, ?, ?, ?, ?, ?, ?, ?)"
    );
    let query = sqlx::query(&sql)
        .bind(item.portal_id)
        .bind(item.portal_tender_uid.clone());
    let done = bind_fields(query, &item.fields)
        .bind(item.tender_status.as_str())
        .bind(item.is_live)
        .bind(encode_ts(item.first_seen_at))
        .bind(encode_ts(item.last_seen_at))
        .bind(item.closed_at.map(encode_ts))
        .bind(item.archived_at.map(encode_ts))
        .bind(item.source_run_id)
        .execute(&mut *conn)
        .await?;
    Ok(done.last_insert_rowid())
}

async fn update_tender(conn: &mut SqliteConnection, item: &TenderItem) -> StoreResult<()> {
    let sql = format!(
        "UPDATE tender_items SET {FIELD_ASSIGNMENTS}, tender_status = ?, is_live = ?, last_seen_at = ?, \
         closed_at = ?, archived_at = ?, source_run_id = ? WHERE id = ?"
    );
    bind_fields(sqlx::query(&sql), &item.fields)
        .bind(item.tender_status.as_str())
        .bind(item.is_live)
        .bind(encode_ts(item.last_seen_at))
        .bind(item.closed_at.map(encode_ts))
        .bind(item.archived_at.map(encode_ts))
        .bind(item.source_run_id)
        .bind(item.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_snapshot(
    conn: &mut SqliteConnection,
    item: &TenderItem,
    run_id: Option<RunId>,
    captured_at: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO tender_snapshots (tender_id, run_id, captured_at, {FIELD_COLUMNS}, tender_status, is_live) \
         VALUES (?, ?, ?, {FIELD_PLACEHOLDERS}, ?, ?)"
    );
    let query = sqlx::query(&sql)
        .bind(item.id)
        .bind(run_id)
        .bind(encode_ts(captured_at));
    bind_fields(query, &item.fields)
        .bind(item.tender_status.as_str())
        .bind(item.is_live)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_transition(
    conn: &mut SqliteConnection,
    tender_id: TenderId,
    old: Option<TenderStatus>,
    new: TenderStatus,
    changed_at: DateTime<Utc>,
    reason: &str,
    run_id: Option<RunId>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO status_transitions (tender_id, old_status, new_status, changed_at, reason, run_id)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tender_id)
    .bind(old.map(TenderStatus::as_str))
    .bind(new.as_str())
    .bind(encode_ts(changed_at))
    .bind(reason)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
