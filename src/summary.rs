//! Daily summary rollups.
//!
//! `daily_summary` is a pure derivation of the jobs table through the
//! charging view. Refreshing a day is delete-then-insert in one
//! transaction, so re-running after a partial failure converges to the
//! same totals instead of double counting.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::params;

use crate::models::DailySummary;
use crate::parsers::date_range;
use crate::store::JobStore;

/// Rebuild the summary rows for one day from the charging view.
///
/// Jobs missing any of user, account, or queue are excluded: a tuple with
/// a NULL dimension cannot be attributed and would collapse unrelated
/// jobs into one row.
pub fn refresh(store: &mut JobStore, date: NaiveDate) -> Result<usize> {
    let tx = store.conn_mut().transaction()?;
    tx.execute(
        "DELETE FROM daily_summary WHERE date = ?1",
        params![date.to_string()],
    )?;
    let inserted = tx.execute(
        "INSERT INTO daily_summary \
           (date, user, account, queue, job_count, charge_hours, cpu_hours, gpu_hours, memory_hours) \
         SELECT date(\"end\"), user, account, queue, COUNT(*), \
                SUM(charge_hours), SUM(cpu_hours), SUM(gpu_hours), SUM(memory_hours) \
         FROM v_jobs_charged \
         WHERE date(\"end\") = ?1 \
           AND user IS NOT NULL AND account IS NOT NULL AND queue IS NOT NULL \
         GROUP BY user, account, queue",
        params![date.to_string()],
    )?;
    tx.commit().context("failed to commit summary refresh")?;
    Ok(inserted)
}

/// Refresh every day in the inclusive range. Returns total rows written.
pub fn refresh_range(store: &mut JobStore, start: NaiveDate, end: NaiveDate) -> Result<usize> {
    let mut total = 0;
    for day in date_range(start, end) {
        total += refresh(store, day)?;
    }
    Ok(total)
}

/// All days that have at least one summary row.
pub fn summarized_dates(store: &JobStore) -> Result<BTreeSet<NaiveDate>> {
    let mut stmt = store
        .conn()
        .prepare("SELECT DISTINCT date FROM daily_summary")?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut dates = BTreeSet::new();
    for row in rows {
        let raw = row?;
        let date = raw
            .parse::<NaiveDate>()
            .with_context(|| format!("malformed date in daily_summary: {raw}"))?;
        dates.insert(date);
    }
    Ok(dates)
}

/// Summary rows in the half-open range `[start, end)`, ordered by date
/// then user.
pub fn rows_in_range(store: &JobStore, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailySummary>> {
    let mut stmt = store.conn().prepare(
        "SELECT date, user, account, queue, job_count, charge_hours, cpu_hours, gpu_hours, memory_hours \
         FROM daily_summary WHERE date >= ?1 AND date < ?2 \
         ORDER BY date, user, account, queue",
    )?;
    let rows = stmt.query_map(params![start.to_string(), end.to_string()], |r| {
        Ok((
            r.get::<_, String>(0)?,
            DailySummary {
                date: NaiveDate::default(),
                user: r.get(1)?,
                account: r.get(2)?,
                queue: r.get(3)?,
                job_count: r.get(4)?,
                charge_hours: r.get(5)?,
                cpu_hours: r.get(6)?,
                gpu_hours: r.get(7)?,
                memory_hours: r.get(8)?,
            },
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (raw_date, mut summary) = row?;
        summary.date = raw_date
            .parse()
            .with_context(|| format!("malformed date in daily_summary: {raw_date}"))?;
        out.push(summary);
    }
    Ok(out)
}
