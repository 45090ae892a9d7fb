//! Range-sync behavior: idempotent ingestion, duplicate skipping, and
//! per-day summary bookkeeping across a multi-day window.

mod common;

use common::{day, raw_record, FakeSource};
use jobhist::models::Machine;
use jobhist::store::{DayStatus, JobStore};
use jobhist::summary;
use jobhist::sync::{sync_range, DayOutcome, SyncOptions};

/// Two days of 10 and 12 records, where one of the second day's records
/// repeats a first-day record. The repeat is skipped, leaving 21 unique
/// rows, and re-running the whole range changes nothing.
#[tokio::test]
async fn test_two_day_scenario_with_one_duplicate() {
    let day1: Vec<_> = (1..=10).map(|i| raw_record(i, "alice", "2025-03-01")).collect();
    let mut day2: Vec<_> = (11..=22).map(|i| raw_record(i, "bob", "2025-03-02")).collect();
    // record 11 is byte-identical to record 1: same id, same submit
    day2[0] = raw_record(1, "alice", "2025-03-01");

    let source = FakeSource::default()
        .with_day("2025-03-01", day1)
        .with_day("2025-03-02", day2);

    let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
    let report = sync_range(
        &mut store,
        &source,
        day("2025-03-01"),
        day("2025-03-02"),
        SyncOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.synced(), 2);
    assert_eq!(report.failed(), 0);
    let totals = report.totals();
    assert_eq!(totals.fetched, 22);
    assert_eq!(totals.inserted, 21);
    assert_eq!(totals.skipped_duplicates, 1);
    assert_eq!(store.count_jobs().unwrap(), 21);

    assert_eq!(
        store.day_status(day("2025-03-01")).unwrap(),
        Some(DayStatus::Summarized)
    );
    assert_eq!(
        store.day_status(day("2025-03-02")).unwrap(),
        Some(DayStatus::Summarized)
    );

    // re-running the whole range is a no-op
    let report = sync_range(
        &mut store,
        &source,
        day("2025-03-01"),
        day("2025-03-02"),
        SyncOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(report.skipped(), 2);
    assert_eq!(store.count_jobs().unwrap(), 21);
}

#[tokio::test]
async fn test_overlapping_ranges_do_not_double_ingest() {
    let source = FakeSource::default()
        .with_day("2025-03-01", vec![raw_record(1, "alice", "2025-03-01")])
        .with_day("2025-03-02", vec![raw_record(2, "alice", "2025-03-02")])
        .with_day("2025-03-03", vec![raw_record(3, "alice", "2025-03-03")]);

    let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
    sync_range(
        &mut store,
        &source,
        day("2025-03-01"),
        day("2025-03-02"),
        SyncOptions::default(),
    )
    .await
    .unwrap();
    let report = sync_range(
        &mut store,
        &source,
        day("2025-03-02"),
        day("2025-03-03"),
        SyncOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.skipped(), 1);
    assert_eq!(report.synced(), 1);
    assert_eq!(store.count_jobs().unwrap(), 3);

    let dates = summary::summarized_dates(&store).unwrap();
    assert_eq!(dates.len(), 3);
}

#[tokio::test]
async fn test_empty_day_still_marked_summarized() {
    let source = FakeSource::default();
    let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();

    let report = sync_range(
        &mut store,
        &source,
        day("2025-03-01"),
        day("2025-03-01"),
        SyncOptions::default(),
    )
    .await
    .unwrap();
    assert!(matches!(report.days[0].1, DayOutcome::Synced(_)));
    assert_eq!(
        store.day_status(day("2025-03-01")).unwrap(),
        Some(DayStatus::Summarized)
    );
}
