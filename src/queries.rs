//! Analytical queries over the charged-job view and the summary table.
//!
//! Three shapes: grouped totals by a dimension, range-bucket histograms
//! over a resource metric, and day/month/quarter time series. Simple
//! grouping runs in SQL; bucketing and quarter roll-ups carry per-row
//! user identity into Rust, because distinct-user counts cannot be
//! re-aggregated from subtotals.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use anyhow::{bail, Result};
use rusqlite::params;
use serde::Serialize;

use crate::models::DateRange;
use crate::store::JobStore;

/// Which hour column a usage query totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceFamily {
    Cpu,
    Gpu,
    #[default]
    All,
}

impl ResourceFamily {
    /// SQL expression over `v_jobs_charged` columns.
    pub fn hours_expr(&self) -> &'static str {
        match self {
            ResourceFamily::Cpu => "cpu_hours",
            ResourceFamily::Gpu => "gpu_hours",
            ResourceFamily::All => "cpu_hours + gpu_hours",
        }
    }
}

impl FromStr for ResourceFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(ResourceFamily::Cpu),
            "gpu" => Ok(ResourceFamily::Gpu),
            "all" => Ok(ResourceFamily::All),
            other => bail!("unknown resource family: {other} (expected cpu, gpu, or all)"),
        }
    }
}

/// Grouping dimension for totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dimension {
    #[default]
    User,
    Account,
    Queue,
}

impl Dimension {
    pub fn column(&self) -> &'static str {
        match self {
            Dimension::User => "user",
            Dimension::Account => "account",
            Dimension::Queue => "queue",
        }
    }
}

impl FromStr for Dimension {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Dimension::User),
            "account" => Ok(Dimension::Account),
            "queue" => Ok(Dimension::Queue),
            other => bail!("unknown dimension: {other} (expected user, account, or queue)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupTotal {
    pub key: String,
    pub job_count: i64,
    pub hours: f64,
}

/// Totals grouped by a dimension, largest first. Rows with a NULL
/// dimension value are excluded, they cannot be attributed.
pub fn grouped_totals(
    store: &JobStore,
    dim: Dimension,
    family: ResourceFamily,
    range: &DateRange,
) -> Result<Vec<GroupTotal>> {
    let sql = format!(
        "SELECT {col}, COUNT(*), SUM({hours}) FROM v_jobs_charged \
         WHERE {col} IS NOT NULL AND \"end\" >= ?1 AND \"end\" < ?2 \
         GROUP BY {col} ORDER BY SUM({hours}) DESC, {col}",
        col = dim.column(),
        hours = family.hours_expr(),
    );
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(params![range.start_bound(), range.end_bound()], |r| {
        Ok(GroupTotal {
            key: r.get(0)?,
            job_count: r.get(1)?,
            hours: r.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Resource dimension for range-bucket histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMetric {
    Gpus,
    Nodes,
    Cores,
    ReqMemGb,
    /// Job run time in seconds.
    ElapsedSecs,
}

impl BucketMetric {
    fn value_expr(&self) -> &'static str {
        match self {
            BucketMetric::Gpus => "CAST(numgpus AS REAL)",
            BucketMetric::Nodes => "CAST(numnodes AS REAL)",
            BucketMetric::Cores => "CAST(numcpus AS REAL)",
            BucketMetric::ReqMemGb => "CAST(reqmem AS REAL) / 1073741824.0",
            BucketMetric::ElapsedSecs => "CAST(elapsed AS REAL)",
        }
    }

    /// Default boundaries for the CLI when none are given. Elapsed-time
    /// boundaries are 30s, 30m, 1h, 5h, 12h, and 18h.
    pub fn default_bounds(&self) -> &'static [i64] {
        match self {
            BucketMetric::Gpus => &[1, 2, 4, 8, 16],
            BucketMetric::Nodes => &[1, 4, 16, 64, 256, 1024],
            BucketMetric::Cores => &[128, 256, 512, 1024, 2048, 4096],
            BucketMetric::ReqMemGb => &[4, 8, 16, 32, 64, 128, 256],
            BucketMetric::ElapsedSecs => &[30, 1800, 3600, 18000, 43200, 64800],
        }
    }

    /// Display label for the bucket above `lower`; `upper` is `None` for
    /// the overflow bucket. Count-valued metrics label `(4, 8]` as `5-8`;
    /// duration boundaries read as humanized times, `(1800, 3600]` is
    /// `30m-1h`.
    fn bucket_label(&self, lower: i64, upper: Option<i64>) -> String {
        if *self == BucketMetric::ElapsedSecs {
            return match upper {
                Some(hi) if lower == 0 => format!("<{}", fmt_duration(hi)),
                Some(hi) => fmt_duration_span(lower, hi),
                None => format!(">{}", fmt_duration(lower)),
            };
        }
        match upper {
            Some(hi) if lower + 1 == hi => format!("{hi}"),
            Some(hi) => format!("{}-{hi}", lower + 1),
            None => format!(">{lower}"),
        }
    }
}

/// Whole seconds to the coarsest exact unit: `64800` is `18h`, `1800` is
/// `30m`, `45` stays `45s`.
fn fmt_duration(secs: i64) -> String {
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn fmt_duration_span(lo: i64, hi: i64) -> String {
    let lo = fmt_duration(lo);
    let hi = fmt_duration(hi);
    // collapse a shared unit: "5h-12h" reads as "5-12h"
    if lo.chars().last() == hi.chars().last() {
        format!("{}-{hi}", &lo[..lo.len() - 1])
    } else {
        format!("{lo}-{hi}")
    }
}

impl FromStr for BucketMetric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gpu" | "gpus" => Ok(BucketMetric::Gpus),
            "node" | "nodes" => Ok(BucketMetric::Nodes),
            "core" | "cores" => Ok(BucketMetric::Cores),
            "memory" | "mem" => Ok(BucketMetric::ReqMemGb),
            "duration" | "durations" | "elapsed" => Ok(BucketMetric::ElapsedSecs),
            other => bail!(
                "unknown bucket metric: {other} (expected gpu, node, core, memory, or duration)"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketRow {
    pub label: String,
    /// Exclusive numeric lower bound; i64::MAX never appears here, the
    /// overflow bucket carries the last boundary.
    pub lower: i64,
    pub job_count: i64,
    pub user_count: i64,
    pub hours: f64,
    /// Mean queue wait in hours, absent when no job in the bucket has
    /// both eligible and start timestamps.
    pub avg_wait_hours: Option<f64>,
}

#[derive(Default)]
struct BucketAccum {
    job_count: i64,
    users: HashSet<String>,
    hours: f64,
    wait_sum: f64,
    wait_count: i64,
}

/// Histogram of jobs over `(lo, hi]` buckets defined by ascending integer
/// boundaries, with an implicit first bound of zero and an overflow bucket
/// above the last boundary. Jobs with a missing or non-positive metric
/// value are not bucketed.
pub fn bucketed(
    store: &JobStore,
    metric: BucketMetric,
    bounds: &[i64],
    family: ResourceFamily,
    range: &DateRange,
) -> Result<Vec<BucketRow>> {
    if bounds.is_empty() {
        bail!("bucket boundaries must not be empty");
    }
    if bounds.windows(2).any(|w| w[0] >= w[1]) || bounds[0] <= 0 {
        bail!("bucket boundaries must be positive and strictly ascending");
    }

    let sql = format!(
        "SELECT {value} AS v, user, {hours}, \
                CASE WHEN eligible IS NOT NULL AND start IS NOT NULL \
                     THEN (julianday(start) - julianday(eligible)) * 24.0 END \
         FROM v_jobs_charged WHERE \"end\" >= ?1 AND \"end\" < ?2",
        value = metric.value_expr(),
        hours = family.hours_expr(),
    );
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(params![range.start_bound(), range.end_bound()], |r| {
        Ok((
            r.get::<_, Option<f64>>(0)?,
            r.get::<_, Option<String>>(1)?,
            r.get::<_, f64>(2)?,
            r.get::<_, Option<f64>>(3)?,
        ))
    })?;

    // one accumulator per bucket plus the overflow bucket at the end
    let mut accums: Vec<BucketAccum> = (0..=bounds.len()).map(|_| BucketAccum::default()).collect();
    for row in rows {
        let (value, user, hours, wait) = row?;
        let value = match value {
            Some(v) if v > 0.0 => v,
            _ => continue,
        };
        let idx = bounds
            .iter()
            .position(|&b| value <= b as f64)
            .unwrap_or(bounds.len());
        let acc = &mut accums[idx];
        acc.job_count += 1;
        acc.hours += hours;
        if let Some(user) = user {
            acc.users.insert(user);
        }
        if let Some(wait) = wait {
            acc.wait_sum += wait;
            acc.wait_count += 1;
        }
    }

    let mut out = Vec::with_capacity(accums.len());
    let mut lower = 0i64;
    for (idx, acc) in accums.into_iter().enumerate() {
        let label = metric.bucket_label(lower, bounds.get(idx).copied());
        out.push(BucketRow {
            label,
            lower,
            job_count: acc.job_count,
            user_count: acc.users.len() as i64,
            hours: acc.hours,
            avg_wait_hours: (acc.wait_count > 0).then(|| acc.wait_sum / acc.wait_count as f64),
        });
        if idx < bounds.len() {
            lower = bounds[idx];
        }
    }
    Ok(out)
}

/// Calendar resolution for time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Day,
    Month,
    Quarter,
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            other => bail!("unknown granularity: {other} (expected day, month, or quarter)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodRow {
    /// `YYYY-MM-DD`, `YYYY-MM`, or `YYYY-Qn` depending on granularity.
    pub period: String,
    pub job_count: i64,
    pub user_count: i64,
    pub hours: f64,
}

/// Usage aggregated per calendar period, ascending by period.
///
/// Quarters are folded from month-level rows that retain per-user
/// identity: the distinct-user count of a quarter is the size of the
/// union of its months' user sets, not a sum of monthly counts.
pub fn time_series(
    store: &JobStore,
    granularity: Granularity,
    family: ResourceFamily,
    range: &DateRange,
) -> Result<Vec<PeriodRow>> {
    let period_expr = match granularity {
        Granularity::Day => "date(\"end\")",
        Granularity::Month | Granularity::Quarter => "strftime('%Y-%m', \"end\")",
    };

    if granularity == Granularity::Quarter {
        return quarter_series(store, period_expr, family, range);
    }

    let sql = format!(
        "SELECT {period_expr} AS period, COUNT(*), COUNT(DISTINCT user), SUM({hours}) \
         FROM v_jobs_charged WHERE \"end\" >= ?1 AND \"end\" < ?2 \
         GROUP BY period ORDER BY period",
        hours = family.hours_expr(),
    );
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(params![range.start_bound(), range.end_bound()], |r| {
        Ok(PeriodRow {
            period: r.get(0)?,
            job_count: r.get(1)?,
            user_count: r.get(2)?,
            hours: r.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn quarter_series(
    store: &JobStore,
    month_expr: &str,
    family: ResourceFamily,
    range: &DateRange,
) -> Result<Vec<PeriodRow>> {
    // month-per-user rows, so user identity survives into the fold
    let sql = format!(
        "SELECT {month_expr} AS month, user, COUNT(*), SUM({hours}) \
         FROM v_jobs_charged WHERE \"end\" >= ?1 AND \"end\" < ?2 \
         GROUP BY month, user",
        hours = family.hours_expr(),
    );
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(params![range.start_bound(), range.end_bound()], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, Option<String>>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, f64>(3)?,
        ))
    })?;

    struct QuarterAccum {
        job_count: i64,
        users: HashSet<String>,
        hours: f64,
    }

    // BTreeMap keys sort "YYYY-Qn" chronologically across year boundaries
    let mut quarters: BTreeMap<String, QuarterAccum> = BTreeMap::new();
    for row in rows {
        let (month, user, job_count, hours) = row?;
        let key = quarter_of(&month)?;
        let acc = quarters.entry(key).or_insert_with(|| QuarterAccum {
            job_count: 0,
            users: HashSet::new(),
            hours: 0.0,
        });
        acc.job_count += job_count;
        acc.hours += hours;
        if let Some(user) = user {
            acc.users.insert(user);
        }
    }

    Ok(quarters
        .into_iter()
        .map(|(period, acc)| PeriodRow {
            period,
            job_count: acc.job_count,
            user_count: acc.users.len() as i64,
            hours: acc.hours,
        })
        .collect())
}

/// `"2025-02"` → `"2025-Q1"`.
fn quarter_of(month: &str) -> Result<String> {
    let (year, mm) = month
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("malformed month key: {month}"))?;
    let mm: u32 = mm.parse()?;
    if !(1..=12).contains(&mm) {
        bail!("malformed month key: {month}");
    }
    Ok(format!("{year}-Q{}", (mm - 1) / 3 + 1))
}

/// Totals over the summary table for a half-open range. Fast path for the
/// `usage` command; also the counterpart of a direct charged-job scan in
/// the consistency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SummaryTotals {
    pub job_count: i64,
    pub charge_hours: f64,
    pub cpu_hours: f64,
    pub gpu_hours: f64,
    pub memory_hours: f64,
}

pub fn summary_totals(store: &JobStore, range: &DateRange) -> Result<SummaryTotals> {
    let totals = store.conn().query_row(
        "SELECT COALESCE(SUM(job_count), 0), COALESCE(SUM(charge_hours), 0.0), \
                COALESCE(SUM(cpu_hours), 0.0), COALESCE(SUM(gpu_hours), 0.0), \
                COALESCE(SUM(memory_hours), 0.0) \
         FROM daily_summary WHERE date >= ?1 AND date < ?2",
        params![range.start.to_string(), range.end.to_string()],
        |r| {
            Ok(SummaryTotals {
                job_count: r.get(0)?,
                charge_hours: r.get(1)?,
                cpu_hours: r.get(2)?,
                gpu_hours: r.get(3)?,
                memory_hours: r.get(4)?,
            })
        },
    )?;
    Ok(totals)
}
