//! Consistency audit over the canonical store and its derived rows.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tivs_core::{TenderId, TenderStatus};

use crate::rows::tender_from_row;
use crate::{StoreResult, TenderStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub tenders_checked: u64,
    /// `is_live` disagrees with `tender_status`.
    pub live_mismatch: Vec<TenderId>,
    pub missing_index: Vec<TenderId>,
    /// Index text differs from the canonical searchable fields.
    pub stale_index: Vec<TenderId>,
    /// Index rows whose tender no longer exists.
    pub orphan_index: Vec<TenderId>,
    /// Transition history does not chain from nothing to the current status.
    pub broken_transitions: Vec<TenderId>,
    pub missing_snapshots: Vec<TenderId>,
    /// Transitions disagree with the status changes recorded across snapshots.
    pub history_mismatch: Vec<TenderId>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.live_mismatch.is_empty()
            && self.missing_index.is_empty()
            && self.stale_index.is_empty()
            && self.orphan_index.is_empty()
            && self.broken_transitions.is_empty()
            && self.missing_snapshots.is_empty()
            && self.history_mismatch.is_empty()
    }
}

/// `true` when `chain` starts from no status, every step continues from the
/// previous one and the last step lands on `current`.
fn chain_is_valid(chain: &[(Option<TenderStatus>, TenderStatus)], current: TenderStatus) -> bool {
    let Some((first_old, _)) = chain.first() else {
        return false;
    };
    if first_old.is_some() {
        return false;
    }
    let continuous = chain.windows(2).all(|pair| pair[1].0 == Some(pair[0].1));
    continuous && chain.last().map(|(_, new)| *new) == Some(current)
}

/// `true` when each transition lands on the next distinct status seen across
/// the ordered snapshots, and no status change is missing a transition.
fn history_matches(snapshots: &[TenderStatus], chain: &[(Option<TenderStatus>, TenderStatus)]) -> bool {
    let mut changes = snapshots.to_vec();
    changes.dedup();
    changes.len() == chain.len() && changes.iter().zip(chain).all(|(seen, (_, new))| seen == new)
}

impl TenderStore {
    /// Audit every tender in one read transaction.
    pub async fn verify_integrity(&self) -> StoreResult<IntegrityReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = IntegrityReport::default();

        let rows = sqlx::query(
            r#"
            SELECT t.*, s.search_text AS indexed_text,
                   EXISTS (SELECT 1 FROM tender_snapshots n WHERE n.tender_id = t.id) AS has_snapshot
              FROM tender_items t
              LEFT JOIN search_index s ON s.tender_id = t.id
             ORDER BY t.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut current = BTreeMap::new();
        for row in &rows {
            let item = tender_from_row(row)?;
            report.tenders_checked += 1;
            if item.is_live != item.tender_status.is_live() {
                report.live_mismatch.push(item.id);
            }
            match row.try_get::<Option<String>, _>("indexed_text")? {
                None => report.missing_index.push(item.id),
                Some(text) if text != item.fields.search_text() => report.stale_index.push(item.id),
                Some(_) => {}
            }
            if !row.try_get::<bool, _>("has_snapshot")? {
                report.missing_snapshots.push(item.id);
            }
            current.insert(item.id, item.tender_status);
        }

        report.orphan_index = sqlx::query_scalar(
            "SELECT tender_id FROM search_index WHERE tender_id NOT IN (SELECT id FROM tender_items) ORDER BY tender_id",
        )
        .fetch_all(&mut *tx)
        .await?;

        let transitions = sqlx::query(
            "SELECT tender_id, old_status, new_status FROM status_transitions ORDER BY tender_id, id",
        )
        .fetch_all(&mut *tx)
        .await?;
        let snapshots = sqlx::query("SELECT tender_id, tender_status FROM tender_snapshots ORDER BY tender_id, id")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut observed: HashMap<TenderId, Vec<TenderStatus>> = HashMap::new();
        for row in &snapshots {
            let status = row.try_get::<String, _>("tender_status")?.parse()?;
            observed.entry(row.try_get("tender_id")?).or_default().push(status);
        }

        let mut chains: HashMap<TenderId, Vec<(Option<TenderStatus>, TenderStatus)>> = HashMap::new();
        for row in &transitions {
            let old = row
                .try_get::<Option<String>, _>("old_status")?
                .map(|s| s.parse())
                .transpose()?;
            let new = row.try_get::<String, _>("new_status")?.parse()?;
            chains.entry(row.try_get("tender_id")?).or_default().push((old, new));
        }
        for (tender_id, status) in &current {
            let chain = chains.get(tender_id).map(Vec::as_slice).unwrap_or_default();
            if !chain_is_valid(chain, *status) {
                report.broken_transitions.push(*tender_id);
            }
            let seen = observed.get(tender_id).map(Vec::as_slice).unwrap_or_default();
            if !history_matches(seen, chain) {
                report.history_mismatch.push(*tender_id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_store;
    use tivs_core::RawRecord;
    use TenderStatus::*;

    #[test]
    fn chain_validation() {
        assert!(chain_is_valid(&[(None, Open), (Some(Open), Closed)], Closed));
        assert!(!chain_is_valid(&[], Open));
        assert!(!chain_is_valid(&[(Some(Open), Closed)], Closed));
        assert!(!chain_is_valid(&[(None, Open), (Some(Closed), Archived)], Archived));
        assert!(!chain_is_valid(&[(None, Open)], Closed));
    }

    #[test]
    fn history_comparison() {
        let chain = [(None, Open), (Some(Open), Closed), (Some(Closed), Open)];
        assert!(history_matches(&[Open, Open, Closed, Open], &chain));
        assert!(!history_matches(&[Open, Open], &chain));
        assert!(!history_matches(&[Closed, Open], &[(None, Closed), (Some(Closed), Archived), (Some(Archived), Open)]));
        assert!(!history_matches(&[Open, Closed], &[(None, Open), (Some(Open), Cancelled)]));
    }

    #[tokio::test]
    async fn fresh_ingest_is_clean_and_tampering_is_detected() {
        let (_dir, store) = temp_store().await;
        let portal = store.register_portal("hp", "HP", "https://a").await.unwrap();
        let run = store.start_run(portal, "all").await.unwrap();
        store
            .apply_batch(
                run,
                &[
                    RawRecord::new().with("uid", "A").with("title", "Bridge"),
                    RawRecord::new().with("uid", "B").with("title", "Road"),
                ],
            )
            .await
            .unwrap();

        let report = store.verify_integrity().await.unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.tenders_checked, 2);

        sqlx::query("UPDATE search_index SET search_text = 'tampered' WHERE tender_id = (SELECT id FROM tender_items WHERE portal_tender_uid = 'A')")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM search_index WHERE tender_id = (SELECT id FROM tender_items WHERE portal_tender_uid = 'B')")
            .execute(store.pool())
            .await
            .unwrap();

        let report = store.verify_integrity().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.stale_index.len(), 1);
        assert_eq!(report.missing_index.len(), 1);
    }

    #[tokio::test]
    async fn transition_without_matching_snapshot_is_flagged() {
        let (_dir, store) = temp_store().await;
        let portal = store.register_portal("hp", "HP", "https://a").await.unwrap();
        let run = store.start_run(portal, "all").await.unwrap();
        store
            .apply_batch(run, &[RawRecord::new().with("uid", "A").with("title", "Bridge")])
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO status_transitions (tender_id, old_status, new_status, changed_at) \
             SELECT id, 'open', 'open', '2026-01-01T00:00:00.000000Z' FROM tender_items",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let report = store.verify_integrity().await.unwrap();
        assert_eq!(report.history_mismatch.len(), 1);
        assert!(!report.is_clean());
    }
}
