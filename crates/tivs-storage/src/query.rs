//! Read side: filtered listings over the live/archive views, full-text
//! search, per-portal health and tender history.
//!
//! Multi-statement reads run inside one read transaction so a page and its
//! total come from the same committed state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tivs_core::{
    normalize_search_text, Portal, PortalId, StatusTransition, TenderId, TenderItem, TenderSnapshot,
    TenderStatus,
};

use crate::rows::{portal_from_row, snapshot_from_row, tender_from_row, transition_from_row};
use crate::{decode_ts, encode_ts, StoreResult, TenderStore};

pub const DEFAULT_PER_PAGE: u32 = 25;
pub const MAX_PER_PAGE: u32 = 200;

/// Which derived view a read goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    #[default]
    All,
    Live,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderDetail {
    pub tender: TenderItem,
    pub snapshots: Vec<TenderSnapshot>,
    pub transitions: Vec<StatusTransition>,
}

impl Partition {
    fn source(self) -> &'static str {
        match self {
            Self::All => "tender_items",
            Self::Live => "live_tenders",
            Self::Archive => "archived_tenders",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenderQuery {
    /// Portal slug.
    pub portal: Option<String>,
    pub status: Option<TenderStatus>,
    pub partition: Partition,
    pub closing_from: Option<DateTime<Utc>>,
    pub closing_to: Option<DateTime<Utc>>,
    /// Bounds on the parsed estimated cost.
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub state: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub work_type: Option<String>,
    /// 1-based; 0 is treated as 1.
    pub page: u32,
    pub per_page: u32,
}

impl TenderQuery {
    fn page(&self) -> u32 {
        self.page.max(1)
    }

    fn per_page(&self) -> u32 {
        match self.per_page {
            0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        }
    }

    fn push_filters(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(" WHERE 1 = 1");
        if let Some(slug) = &self.portal {
            builder
                .push(" AND t.portal_id = (SELECT id FROM portals WHERE slug = ")
                .push_bind(slug.clone())
                .push(")");
        }
        if let Some(status) = self.status {
            builder.push(" AND t.tender_status = ").push_bind(status.as_str());
        }
        if let Some(from) = self.closing_from {
            builder.push(" AND t.closing_at >= ").push_bind(encode_ts(from));
        }
        if let Some(to) = self.closing_to {
            builder.push(" AND t.closing_at <= ").push_bind(encode_ts(to));
        }
        if let Some(min) = self.min_amount {
            builder.push(" AND t.estimated_cost >= ").push_bind(min);
        }
        if let Some(max) = self.max_amount {
            builder.push(" AND t.estimated_cost <= ").push_bind(max);
        }
        for (column, value) in [
            ("state", &self.state),
            ("district", &self.district),
            ("city", &self.city),
            ("work_type", &self.work_type),
        ] {
            if let Some(value) = value {
                builder
                    .push(format!(" AND lower(t.{column}) = lower("))
                    .push_bind(value.trim().to_string())
                    .push(")");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalHealth {
    pub portal: Portal,
    pub last_successful_run_at: Option<DateTime<Utc>>,
    pub live_tenders: u64,
    pub total_tenders: u64,
}

impl TenderStore {
    pub async fn list_tenders(&self, query: &TenderQuery) -> StoreResult<Page<TenderItem>> {
        let (page, per_page) = (query.page(), query.per_page());
        let source = query.partition.source();
        let mut tx = self.pool.begin().await?;

        let mut count = QueryBuilder::new(format!("SELECT COUNT(*) FROM {source} t"));
        query.push_filters(&mut count);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&mut *tx).await?;

        let mut select = QueryBuilder::new(format!("SELECT t.* FROM {source} t"));
        query.push_filters(&mut select);
        select
            .push(" ORDER BY t.closing_at IS NULL, t.closing_at ASC, t.id ASC LIMIT ")
            .push_bind(i64::from(per_page))
            .push(" OFFSET ")
            .push_bind(i64::from(page - 1) * i64::from(per_page));
        let rows = select.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let total = total.max(0) as u64;
        Ok(Page {
            items: rows.iter().map(tender_from_row).collect::<StoreResult<_>>()?,
            page,
            per_page,
            total,
            total_pages: total.div_ceil(u64::from(per_page)) as u32,
        })
    }

    /// Word-prefix match of every term in `text` against the search index.
    pub async fn search(&self, text: &str, partition: Partition, limit: u32) -> StoreResult<Vec<TenderItem>> {
        let normalized = normalize_search_text(text);
        let terms: Vec<&str> = normalized.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new(format!(
            "SELECT t.* FROM {} t JOIN search_index s ON s.tender_id = t.id WHERE 1 = 1",
            partition.source()
        ));
        for term in terms {
            builder
                .push(" AND (' ' || s.search_text) LIKE ")
                .push_bind(format!("% {term}%"));
        }
        builder
            .push(" ORDER BY t.is_live DESC, t.last_seen_at DESC, t.id DESC LIMIT ")
            .push_bind(i64::from(limit.clamp(1, MAX_PER_PAGE)));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(tender_from_row).collect()
    }

    pub async fn portal_health(&self) -> StoreResult<Vec<PortalHealth>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.slug, p.name, p.base_url, p.is_active, p.health_status, p.last_health_check_at,
                   (SELECT MAX(r.completed_at) FROM scrape_runs r
                     WHERE r.portal_id = p.id AND r.status = 'completed') AS last_successful_run_at,
                   (SELECT COUNT(*) FROM tender_items t WHERE t.portal_id = p.id AND t.is_live = 1) AS live_tenders,
                   (SELECT COUNT(*) FROM tender_items t WHERE t.portal_id = p.id) AS total_tenders
              FROM portals p
             ORDER BY p.slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PortalHealth {
                    portal: portal_from_row(row)?,
                    last_successful_run_at: row
                        .try_get::<Option<String>, _>("last_successful_run_at")?
                        .as_deref()
                        .map(decode_ts)
                        .transpose()?,
                    live_tenders: row.try_get::<i64, _>("live_tenders")?.max(0) as u64,
                    total_tenders: row.try_get::<i64, _>("total_tenders")?.max(0) as u64,
                })
            })
            .collect()
    }

    pub async fn get_tender(&self, tender_id: TenderId) -> StoreResult<Option<TenderItem>> {
        sqlx::query("SELECT * FROM tender_items WHERE id = ?")
            .bind(tender_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tender_from_row(&row))
            .transpose()
    }

    pub async fn get_tender_by_uid(&self, portal_id: PortalId, uid: &str) -> StoreResult<Option<TenderItem>> {
        sqlx::query("SELECT * FROM tender_items WHERE portal_id = ? AND portal_tender_uid = ?")
            .bind(portal_id)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| tender_from_row(&row))
            .transpose()
    }

    /// Observations of a tender, oldest first.
    pub async fn snapshots_for(&self, tender_id: TenderId) -> StoreResult<Vec<TenderSnapshot>> {
        let mut conn = self.pool.acquire().await?;
        fetch_snapshots(&mut conn, tender_id).await
    }

    /// Status changes of a tender, oldest first.
    pub async fn transitions_for(&self, tender_id: TenderId) -> StoreResult<Vec<StatusTransition>> {
        let mut conn = self.pool.acquire().await?;
        fetch_transitions(&mut conn, tender_id).await
    }

    /// A tender with its full history, read from one committed state.
    pub async fn tender_detail(&self, tender_id: TenderId) -> StoreResult<Option<TenderDetail>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query("SELECT * FROM tender_items WHERE id = ?")
            .bind(tender_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let tender = tender_from_row(&row)?;
        let snapshots = fetch_snapshots(&mut tx, tender_id).await?;
        let transitions = fetch_transitions(&mut tx, tender_id).await?;
        tx.commit().await?;
        Ok(Some(TenderDetail {
            tender,
            snapshots,
            transitions,
        }))
    }

    pub async fn search_text_for(&self, tender_id: TenderId) -> StoreResult<Option<String>> {
        Ok(sqlx::query_scalar("SELECT search_text FROM search_index WHERE tender_id = ?")
            .bind(tender_id)
            .fetch_optional(&self.pool)
            .await?)
    }
}

async fn fetch_snapshots(conn: &mut SqliteConnection, tender_id: TenderId) -> StoreResult<Vec<TenderSnapshot>> {
    let rows = sqlx::query("SELECT * FROM tender_snapshots WHERE tender_id = ? ORDER BY id")
        .bind(tender_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(snapshot_from_row).collect()
}

async fn fetch_transitions(conn: &mut SqliteConnection, tender_id: TenderId) -> StoreResult<Vec<StatusTransition>> {
    let rows = sqlx::query("SELECT * FROM status_transitions WHERE tender_id = ? ORDER BY id")
        .bind(tender_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(transition_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_store;
    use chrono::TimeZone;
    use tivs_core::{RawRecord, RunOutcome};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn tender(uid: &str, title: &str, closing: &str, cost: &str, district: &str) -> RawRecord {
        RawRecord::new()
            .with("uid", uid)
            .with("title", title)
            .with("closing_date", closing)
            .with("tender_value", cost)
            .with("state", "Himachal Pradesh")
            .with("district", district)
            .with("work_type", "Works")
    }

    async fn seeded() -> (tempfile::TempDir, TenderStore) {
        let (dir, store) = temp_store().await;
        let hp = store.register_portal("hp", "HP", "https://hp").await.unwrap();
        let mp = store.register_portal("mp", "MP", "https://mp").await.unwrap();

        let run = store.start_run(hp, "all").await.unwrap();
        store
            .apply_batch_at(
                run,
                &[
                    tender("HP-1", "Construction of bridge over Beas", "2026-06-20", "₹ 2,50,000", "Kullu"),
                    tender("HP-2", "Supply of hospital beds", "2026-06-25", "3 Crore", "Shimla"),
                    tender("HP-3", "Road resurfacing phase II", "2026-04-01", "Rs. 5 Lakh", "Kullu"),
                ],
                now(),
            )
            .await
            .unwrap();
        store.finalize_run(run, RunOutcome::Completed, None).await.unwrap();

        let run = store.start_run(mp, "all").await.unwrap();
        store
            .apply_batch_at(run, &[tender("MP-1", "Bridge repair", "2026-07-01", "90000", "Bhopal")], now())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn listing_filters_by_partition_and_portal() {
        let (_dir, store) = seeded().await;

        let live = store
            .list_tenders(&TenderQuery { partition: Partition::Live, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(live.total, 3);
        assert!(live.items.iter().all(|t| t.is_live));

        let archive = store
            .list_tenders(&TenderQuery { partition: Partition::Archive, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(archive.items.len(), 1);
        assert_eq!(archive.items[0].portal_tender_uid, "HP-3");

        let hp = store
            .list_tenders(&TenderQuery { portal: Some("hp".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hp.total, 3);
    }

    #[tokio::test]
    async fn listing_filters_amount_geography_and_dates() {
        let (_dir, store) = seeded().await;
        let query = TenderQuery {
            min_amount: Some(100_000.0),
            max_amount: Some(1_000_000.0),
            district: Some("kullu".into()),
            ..Default::default()
        };
        let page = store.list_tenders(&query).await.unwrap();
        let uids: Vec<_> = page.items.iter().map(|t| t.portal_tender_uid.as_str()).collect();
        assert_eq!(uids, vec!["HP-3", "HP-1"]);

        let query = TenderQuery {
            closing_from: Some(Utc.with_ymd_and_hms(2026, 6, 21, 0, 0, 0).single().unwrap()),
            ..Default::default()
        };
        let uids: Vec<_> = store
            .list_tenders(&query)
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|t| t.portal_tender_uid)
            .collect();
        assert_eq!(uids, vec!["HP-2", "MP-1"]);
    }

    #[tokio::test]
    async fn pagination_reports_totals() {
        let (_dir, store) = seeded().await;
        let page = store
            .list_tenders(&TenderQuery { page: 2, per_page: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn search_matches_word_prefixes_and_respects_partition() {
        let (_dir, store) = seeded().await;
        let hits = store.search("bridge", Partition::All, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store.search("BRIDGE  beas!", Partition::Live, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].portal_tender_uid, "HP-1");

        assert!(store.search("resurf", Partition::Live, 10).await.unwrap().is_empty());
        assert_eq!(store.search("resurf", Partition::Archive, 10).await.unwrap().len(), 1);
        assert!(store.search("   ", Partition::All, 10).await.unwrap().is_empty());
        assert!(store.search("ridge", Partition::All, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn portal_health_reports_counts_and_last_success() {
        let (_dir, store) = seeded().await;
        let health = store.portal_health().await.unwrap();
        assert_eq!(health.len(), 2);

        let hp = &health[0];
        assert_eq!(hp.portal.slug, "hp");
        assert_eq!((hp.live_tenders, hp.total_tenders), (2, 3));
        assert!(hp.last_successful_run_at.is_some());

        let mp = &health[1];
        assert_eq!((mp.live_tenders, mp.total_tenders), (1, 1));
        assert_eq!(mp.last_successful_run_at, None);
    }

    #[tokio::test]
    async fn history_reads_are_ordered() {
        let (_dir, store) = seeded().await;
        let hp = store.get_portal("hp").await.unwrap();
        let item = store.get_tender_by_uid(hp.id, "HP-1").await.unwrap().unwrap();
        assert_eq!(store.get_tender(item.id).await.unwrap(), Some(item.clone()));

        let snapshots = store.snapshots_for(item.id).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].fields, item.fields);

        let transitions = store.transitions_for(item.id).await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].old_status, None);
        assert_eq!(transitions[0].new_status, TenderStatus::Open);

        assert_eq!(
            store.search_text_for(item.id).await.unwrap().as_deref(),
            Some(item.fields.search_text().as_str())
        );
        assert_eq!(store.get_tender_by_uid(hp.id, "missing").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tender_detail_matches_its_history_under_concurrent_writes() {
        let (_dir, store) = temp_store().await;
        let hp = store.register_portal("hp", "HP", "https://hp").await.unwrap();
        let run = store.start_run(hp, "all").await.unwrap();
        store
            .apply_batch(run, &[RawRecord::new().with("uid", "T1").with("title", "rev 0")])
            .await
            .unwrap();
        let id = store.get_tender_by_uid(hp, "T1").await.unwrap().unwrap().id;

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for rev in 1..=40 {
                    let record = RawRecord::new().with("uid", "T1").with("title", format!("rev {rev}"));
                    store.apply_batch(run, &[record]).await.unwrap();
                }
            })
        };
        while !writer.is_finished() {
            let detail = store.tender_detail(id).await.unwrap().unwrap();
            let last = detail.snapshots.last().unwrap();
            assert_eq!(last.fields, detail.tender.fields);
            assert_eq!(detail.transitions.last().unwrap().new_status, detail.tender.tender_status);
        }
        writer.await.unwrap();

        let detail = store.tender_detail(id).await.unwrap().unwrap();
        assert_eq!(detail.snapshots.len(), 41);
        assert_eq!(detail.tender.fields.title.as_deref(), Some("rev 40"));
        assert_eq!(store.tender_detail(id + 100).await.unwrap(), None);
    }
}
