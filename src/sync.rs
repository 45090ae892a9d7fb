//! Day-granular sync orchestration.
//!
//! Each day in the requested range is processed independently: fetch,
//! normalize, ingest, summarize. A failure on one day is recorded in the
//! report and never aborts the rest of the range. The `sync_state` table
//! remembers how far each day got, so a crash between ingest and summary
//! re-runs only the summary step next time.

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::charging;
use crate::models::Job;
use crate::parsers::{date_range, normalize_record};
use crate::remote::JobSource;
use crate::store::{DayStatus, JobStore};
use crate::summary;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-fetch and rewrite days that are already summarized.
    pub force: bool,
    /// Fetch and normalize but write nothing.
    pub dry_run: bool,
}

/// Per-day ingest counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayStats {
    /// Records returned by the remote source.
    pub fetched: usize,
    pub inserted: usize,
    /// Records already present under the same `(job_id, submit)`.
    pub skipped_duplicates: usize,
    /// Records rejected during normalization (no usable job id).
    pub dropped: usize,
    /// Records stored with at least one data-quality flag.
    pub flagged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOutcome {
    Synced(DayStats),
    /// Already summarized and `force` not set.
    Skipped,
    Failed(String),
}

/// Outcome of a sync run over a date range.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub days: Vec<(NaiveDate, DayOutcome)>,
}

impl SyncReport {
    pub fn synced(&self) -> usize {
        self.days
            .iter()
            .filter(|(_, o)| matches!(o, DayOutcome::Synced(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.days
            .iter()
            .filter(|(_, o)| matches!(o, DayOutcome::Skipped))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.days
            .iter()
            .filter(|(_, o)| matches!(o, DayOutcome::Failed(_)))
            .count()
    }

    pub fn totals(&self) -> DayStats {
        let mut total = DayStats::default();
        for (_, outcome) in &self.days {
            if let DayOutcome::Synced(stats) = outcome {
                total.fetched += stats.fetched;
                total.inserted += stats.inserted;
                total.skipped_duplicates += stats.skipped_duplicates;
                total.dropped += stats.dropped;
                total.flagged += stats.flagged;
            }
        }
        total
    }
}

/// Sync every day in the inclusive range `[start, end]`.
pub async fn sync_range(
    store: &mut JobStore,
    source: &dyn JobSource,
    start: NaiveDate,
    end: NaiveDate,
    options: SyncOptions,
) -> Result<SyncReport> {
    let machine = store.machine();
    info!(machine = machine.name(), %start, %end, force = options.force, "starting sync");

    let mut report = SyncReport::default();
    for day in date_range(start, end) {
        let outcome = match sync_day(store, source, day, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(machine = machine.name(), %day, error = %e, "day failed");
                DayOutcome::Failed(format!("{e:#}"))
            }
        };
        report.days.push((day, outcome));
    }

    let totals = report.totals();
    info!(
        machine = machine.name(),
        synced = report.synced(),
        skipped = report.skipped(),
        failed = report.failed(),
        inserted = totals.inserted,
        duplicates = totals.skipped_duplicates,
        "sync finished"
    );
    Ok(report)
}

async fn sync_day(
    store: &mut JobStore,
    source: &dyn JobSource,
    day: NaiveDate,
    options: SyncOptions,
) -> Result<DayOutcome> {
    let machine = store.machine();
    let status = store.day_status(day)?;

    if status == Some(DayStatus::Summarized) && !options.force {
        debug!(%day, "already summarized, skipping");
        return Ok(DayOutcome::Skipped);
    }

    // Stored but not summarized means a previous run died between ingest
    // and rollup. The rows are already there, so only the summary is
    // redone, unless a forced re-fetch was asked for.
    if status == Some(DayStatus::Stored) && !options.force && !options.dry_run {
        info!(machine = machine.name(), %day, "resuming with summary refresh only");
        summary::refresh(store, day)?;
        store.set_day_status(day, DayStatus::Summarized)?;
        return Ok(DayOutcome::Synced(DayStats::default()));
    }

    let raw = source.fetch_day(machine, day).await?;
    let mut stats = DayStats {
        fetched: raw.len(),
        ..Default::default()
    };

    let mut jobs: Vec<Job> = Vec::with_capacity(raw.len());
    for record in &raw {
        match normalize_record(record) {
            Ok(job) => {
                if !job.quality.is_empty() {
                    stats.flagged += 1;
                }
                if let Some(queue) = &job.queue {
                    if !charging::classify(queue).recognized {
                        warn!(machine = machine.name(), %day, queue = %queue, job_id = %job.job_id,
                              "unrecognized queue, charged under default rules");
                    }
                }
                jobs.push(job);
            }
            Err(e) => {
                debug!(%day, error = %e, "dropping record");
                stats.dropped += 1;
            }
        }
    }

    if options.dry_run {
        info!(machine = machine.name(), %day, fetched = stats.fetched,
              dropped = stats.dropped, "dry run, nothing written");
        return Ok(DayOutcome::Synced(stats));
    }

    let insert = if options.force {
        store.replace_day(day, &jobs)?
    } else {
        store.upsert_batch(&jobs)?
    };
    stats.inserted = insert.inserted;
    stats.skipped_duplicates = insert.skipped;
    store.set_day_status(day, DayStatus::Stored)?;

    summary::refresh(store, day)?;
    store.set_day_status(day, DayStatus::Summarized)?;

    debug!(machine = machine.name(), %day, inserted = stats.inserted,
           duplicates = stats.skipped_duplicates, "day complete");
    Ok(DayOutcome::Synced(stats))
}
