//! Row <-> domain mapping shared by the writers and the read queries.

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};
use tivs_core::{
    BackupRecord, Portal, RunCounts, ScrapeRun, StatusTransition, TenderFields, TenderItem,
    TenderSnapshot,
};

use crate::{decode_ts, encode_ts, StoreResult};

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Descriptive columns in the order [`bind_fields`] binds them.
pub(crate) const FIELD_COLUMNS: &str = "title, reference_number, department, organisation_chain, \
     published_at, opening_at, closing_at, emd_text, emd_amount, estimated_cost_text, \
     estimated_cost, tender_type, work_type, payment_type, location, city, district, state, \
     pincode, detail_url";

pub(crate) const FIELD_PLACEHOLDERS: &str = "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?";

pub(crate) const FIELD_ASSIGNMENTS: &str = "title = ?, reference_number = ?, department = ?, \
     organisation_chain = ?, published_at = ?, opening_at = ?, closing_at = ?, emd_text = ?, \
     emd_amount = ?, estimated_cost_text = ?, estimated_cost = ?, tender_type = ?, work_type = ?, \
     payment_type = ?, location = ?, city = ?, district = ?, state = ?, pincode = ?, detail_url = ?";

pub(crate) fn bind_fields<'q>(query: SqliteQuery<'q>, fields: &TenderFields) -> SqliteQuery<'q> {
    query
        .bind(fields.title.clone())
        .bind(fields.reference_number.clone())
        .bind(fields.department.clone())
        .bind(fields.organisation_chain.clone())
        .bind(fields.published_at.map(encode_ts))
        .bind(fields.opening_at.map(encode_ts))
        .bind(fields.closing_at.map(encode_ts))
        .bind(fields.emd_text.clone())
        .bind(fields.emd_amount)
        .bind(fields.estimated_cost_text.clone())
        .bind(fields.estimated_cost)
        .bind(fields.tender_type.clone())
        .bind(fields.work_type.clone())
        .bind(fields.payment_type.clone())
        .bind(fields.location.clone())
        .bind(fields.city.clone())
        .bind(fields.district.clone())
        .bind(fields.state.clone())
        .bind(fields.pincode.clone())
        .bind(fields.detail_url.clone())
}

fn opt_ts(row: &SqliteRow, column: &str) -> StoreResult<Option<chrono::DateTime<chrono::Utc>>> {
    row.try_get::<Option<String>, _>(column)?
        .as_deref()
        .map(decode_ts)
        .transpose()
}

fn ts(row: &SqliteRow, column: &str) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    decode_ts(&row.try_get::<String, _>(column)?)
}

fn count(row: &SqliteRow, column: &str) -> StoreResult<u64> {
    Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
}

pub(crate) fn fields_from_row(row: &SqliteRow) -> StoreResult<TenderFields> {
    Ok(TenderFields {
        title: row.try_get("title")?,
        reference_number: row.try_get("reference_number")?,
        department: row.try_get("department")?,
        organisation_chain: row.try_get("organisation_chain")?,
        published_at: opt_ts(row, "published_at")?,
        opening_at: opt_ts(row, "opening_at")?,
        closing_at: opt_ts(row, "closing_at")?,
        emd_text: row.try_get("emd_text")?,
        emd_amount: row.try_get("emd_amount")?,
        estimated_cost_text: row.try_get("estimated_cost_text")?,
        estimated_cost: row.try_get("estimated_cost")?,
        tender_type: row.try_get("tender_type")?,
        work_type: row.try_get("work_type")?,
        payment_type: row.try_get("payment_type")?,
        location: row.try_get("location")?,
        city: row.try_get("city")?,
        district: row.try_get("district")?,
        state: row.try_get("state")?,
        pincode: row.try_get("pincode")?,
        detail_url: row.try_get("detail_url")?,
    })
}

pub(crate) fn tender_from_row(row: &SqliteRow) -> StoreResult<TenderItem> {
    Ok(TenderItem {
        id: row.try_get("id")?,
        portal_id: row.try_get("portal_id")?,
        portal_tender_uid: row.try_get("portal_tender_uid")?,
        fields: fields_from_row(row)?,
        is_live: row.try_get("is_live")?,
        tender_status: row.try_get::<String, _>("tender_status")?.parse()?,
        first_seen_at: ts(row, "first_seen_at")?,
        last_seen_at: ts(row, "last_seen_at")?,
        closed_at: opt_ts(row, "closed_at")?,
        archived_at: opt_ts(row, "archived_at")?,
        source_run_id: row.try_get("source_run_id")?,
    })
}

pub(crate) fn snapshot_from_row(row: &SqliteRow) -> StoreResult<TenderSnapshot> {
    Ok(TenderSnapshot {
        id: row.try_get("id")?,
        tender_id: row.try_get("tender_id")?,
        run_id: row.try_get("run_id")?,
        captured_at: ts(row, "captured_at")?,
        fields: fields_from_row(row)?,
        tender_status: row.try_get::<String, _>("tender_status")?.parse()?,
        is_live: row.try_get("is_live")?,
    })
}

pub(crate) fn transition_from_row(row: &SqliteRow) -> StoreResult<StatusTransition> {
    Ok(StatusTransition {
        id: row.try_get("id")?,
        tender_id: row.try_get("tender_id")?,
        old_status: row
            .try_get::<Option<String>, _>("old_status")?
            .map(|s| s.parse())
            .transpose()?,
        new_status: row.try_get::<String, _>("new_status")?.parse()?,
        changed_at: ts(row, "changed_at")?,
        reason: row.try_get("reason")?,
        run_id: row.try_get("run_id")?,
    })
}

pub(crate) fn portal_from_row(row: &SqliteRow) -> StoreResult<Portal> {
    Ok(Portal {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        is_active: row.try_get("is_active")?,
        health_status: row.try_get::<String, _>("health_status")?.parse()?,
        last_health_check_at: opt_ts(row, "last_health_check_at")?,
    })
}

pub(crate) fn run_from_row(row: &SqliteRow) -> StoreResult<ScrapeRun> {
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        portal_id: row.try_get("portal_id")?,
        scope: row.try_get("scope")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        started_at: ts(row, "started_at")?,
        completed_at: opt_ts(row, "completed_at")?,
        counts: RunCounts {
            expected: count(row, "expected_count")?,
            extracted: count(row, "extracted_count")?,
            skipped: count(row, "skipped_count")?,
            errors: count(row, "error_count")?,
        },
        output_ref: row.try_get("output_ref")?,
        notes: row.try_get("notes")?,
    })
}

pub(crate) fn backup_from_row(row: &SqliteRow) -> StoreResult<BackupRecord> {
    Ok(BackupRecord {
        id: row.try_get("id")?,
        backup_date: ts(row, "backup_date")?,
        source_path: row.try_get("source_path")?,
        destination_path: row.try_get("destination_path")?,
        tier: row.try_get::<String, _>("tier")?.parse()?,
        outcome: row.try_get::<String, _>("outcome")?.parse()?,
        detail: row.try_get("detail")?,
    })
}
