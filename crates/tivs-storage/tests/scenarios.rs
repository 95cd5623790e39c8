use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use tivs_core::{BackupTier, RawRecord, RunCounts, RunOutcome, RunStatus, TenderStatus};
use tivs_storage::{StoreOptions, TenderStore};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().unwrap()
}

async fn open_store() -> (TempDir, TenderStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = TenderStore::open(StoreOptions::new(dir.path().join("tenders.db")))
        .await
        .unwrap();
    (dir, store)
}

fn tender(uid: &str, closing: &str) -> RawRecord {
    RawRecord::new()
        .with("portal_tender_uid", uid)
        .with("title", format!("Construction work {uid}"))
        .with("department", "Public Works Department")
        .with("closing_date", closing)
        .with("tender_value", "Rs. 12,50,000")
        .with("district", "Kangra")
}

#[tokio::test]
async fn scenario_a_first_sighting_opens_tender() {
    let (_dir, store) = open_store().await;
    let hp = store.register_portal("HP", "Himachal Pradesh", "https://hptenders.gov.in").await.unwrap();
    let run = store.start_run(hp, "all").await.unwrap();

    let report = store.apply_batch_at(run, &[tender("T100", "2026-06-30")], now()).await.unwrap();
    assert_eq!((report.applied, report.created, report.skipped), (1, 1, 0));

    let item = store.get_tender_by_uid(hp, "T100").await.unwrap().unwrap();
    assert_eq!(item.tender_status, TenderStatus::Open);
    assert!(item.is_live);
    assert_eq!(item.first_seen_at, now());
    assert_eq!(item.last_seen_at, now());
    assert_eq!(item.source_run_id, run);
    assert_eq!(item.fields.estimated_cost, Some(1_250_000.0));

    assert_eq!(store.snapshots_for(item.id).await.unwrap().len(), 1);
    let transitions = store.transitions_for(item.id).await.unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].old_status, None);
    assert_eq!(transitions[0].new_status, TenderStatus::Open);
    assert_eq!(transitions[0].run_id, Some(run));
}

#[tokio::test]
async fn scenario_b_reingest_after_closing_closes_tender() {
    let (_dir, store) = open_store().await;
    let hp = store.register_portal("HP", "Himachal Pradesh", "https://hptenders.gov.in").await.unwrap();
    let first = store.start_run(hp, "all").await.unwrap();
    store.apply_batch_at(first, &[tender("T100", "2026-06-30")], now()).await.unwrap();
    store.finalize_run(first, RunOutcome::Completed, None).await.unwrap();

    let later = now() + Duration::days(45);
    let second = store.start_run(hp, "all").await.unwrap();
    let report = store.apply_batch_at(second, &[tender("T100", "2026-06-30")], later).await.unwrap();
    assert_eq!((report.created, report.transitions), (0, 1));

    let item = store.get_tender_by_uid(hp, "T100").await.unwrap().unwrap();
    assert_eq!(item.tender_status, TenderStatus::Closed);
    assert!(!item.is_live);
    assert_eq!(item.closed_at, Some(later));
    assert_eq!(item.archived_at, None);
    assert_eq!(item.source_run_id, second);

    let snapshots = store.snapshots_for(item.id).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[1].run_id, Some(second));
    assert_eq!(snapshots[1].tender_status, TenderStatus::Closed);

    let transitions = store.transitions_for(item.id).await.unwrap();
    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[1].old_status, Some(TenderStatus::Open));
    assert_eq!(transitions[1].new_status, TenderStatus::Closed);
    assert_eq!(transitions[1].run_id, Some(second));
}

#[tokio::test]
async fn scenario_c_blank_uid_is_skipped_and_run_ends_partial() {
    let (_dir, store) = open_store().await;
    let hp = store.register_portal("HP", "Himachal Pradesh", "https://hptenders.gov.in").await.unwrap();
    let run = store.start_run(hp, "all").await.unwrap();

    let batch = vec![
        tender("T1", "2026-06-30"),
        tender("   ", "2026-06-30"),
        tender("T2", "2026-06-30"),
    ];
    let report = store.apply_batch_at(run, &batch, now()).await.unwrap();
    assert_eq!((report.applied, report.skipped, report.errors), (2, 1, 0));

    let counts = RunCounts {
        expected: batch.len() as u64,
        extracted: report.applied,
        skipped: report.skipped,
        errors: report.errors,
    };
    store.record_progress(run, counts).await.unwrap();
    let outcome = RunOutcome::suggest(&counts, report.aborted);
    let finished = store.finalize_run(run, outcome, Some("one record without identifier")).await.unwrap();
    assert_eq!(finished.status, RunStatus::Partial);
    assert_eq!(finished.counts, counts);

    let page = store.list_tenders(&Default::default()).await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_concurrent_workers_commit_independently() {
    let (_dir, store) = open_store().await;
    let hp = store.register_portal("HP", "Himachal Pradesh", "https://hptenders.gov.in").await.unwrap();
    let run = store.start_run(hp, "all").await.unwrap();

    let mut workers = Vec::new();
    for worker in 0..2 {
        let store = store.clone();
        workers.push(tokio::spawn(async move {
            let batch: Vec<RawRecord> = (0..40)
                .map(|n| tender(&format!("W{worker}-{n:03}"), "2026-06-30"))
                .collect();
            store.apply_batch(run, &batch).await
        }));
    }

    let mut applied = 0;
    for worker in workers {
        let report = worker.await.unwrap().unwrap();
        assert_eq!(report.errors, 0, "{:?}", report.error_messages);
        applied += report.applied;
    }
    assert_eq!(applied, 80);
    assert_eq!(store.list_tenders(&Default::default()).await.unwrap().total, 80);
    assert!(store.verify_integrity().await.unwrap().is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_e_backup_during_ingest_sees_only_committed_tenders() {
    let (dir, store) = open_store().await;
    let hp = store.register_portal("HP", "Himachal Pradesh", "https://hptenders.gov.in").await.unwrap();
    let run = store.start_run(hp, "all").await.unwrap();
    store.apply_batch(run, &[tender("SEED", "2026-06-30")]).await.unwrap();

    let ingest = {
        let store = store.clone();
        tokio::spawn(async move {
            let batch: Vec<RawRecord> = (0..150)
                .map(|n| tender(&format!("T{n:04}"), "2026-06-30"))
                .collect();
            store.apply_batch(run, &batch).await
        })
    };

    let backup_root = dir.path().join("backups");
    let record = store
        .create_backup(&backup_root, BackupTier::Daily, tivs_storage::store_now())
        .await
        .unwrap();
    let report = ingest.await.unwrap().unwrap();
    assert_eq!(report.applied, 150);

    let copy = TenderStore::open(StoreOptions::new(&record.destination_path))
        .await
        .unwrap();
    let integrity = copy.verify_integrity().await.unwrap();
    assert!(integrity.is_clean(), "{integrity:?}");
    assert!(integrity.tenders_checked >= 1);
    assert!(integrity.tenders_checked <= 151);
}
