//! Per-machine job store: idempotent ingestion and read access.
//!
//! One [`JobStore`] owns the SQLite connection for one machine. Ingestion
//! goes through [`JobStore::upsert_batch`], which relies on the unique
//! `(job_id, submit)` index and `INSERT OR IGNORE`: a duplicate is not an
//! error, it is the idempotency mechanism, and it is counted rather than
//! raised. Reads of charged data always go through the `v_jobs_charged`
//! view so the active charging rules apply, never a cached computation.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};

use crate::db::{self, ts_from_db, ts_to_db};
use crate::models::{Charge, ChargedJob, DataQuality, DateField, DateRange, Job, Machine};

/// Outcome of a batch ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: usize,
    /// Rows skipped because `(job_id, submit)` already existed.
    pub skipped: usize,
}

/// Per-day sync progress recorded in `sync_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStatus {
    /// Rows ingested, summary not yet committed.
    Stored,
    /// Rows ingested and summary committed.
    Summarized,
}

impl DayStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DayStatus::Stored => "stored",
            DayStatus::Summarized => "summarized",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "stored" => Some(DayStatus::Stored),
            "summarized" => Some(DayStatus::Summarized),
            _ => None,
        }
    }
}

/// Optional filters for charged-job reads. Every dimension is independent;
/// the date range is half-open and applies to the selected timestamp column.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub user: Option<String>,
    pub account: Option<String>,
    pub queue: Option<String>,
    pub status: Option<String>,
    pub range: Option<DateRange>,
    pub date_field: DateField,
}

const JOB_COLUMNS: &str = "job_id, short_id, name, user, account, queue, status, \
submit, eligible, start, \"end\", elapsed, walltime, cputime, \
numcpus, numgpus, numnodes, mpiprocs, ompthreads, reqmem, memory, vmemory, \
cputype, gputype, resources, ptargets, cpupercent, avgcpu, run_count, quality";

pub struct JobStore {
    conn: Connection,
    machine: Machine,
}

impl JobStore {
    /// Open the on-disk store for a machine, creating schema as needed.
    pub fn open(machine: Machine) -> Result<Self> {
        Ok(Self {
            conn: db::open(machine)?,
            machine,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(machine: Machine) -> Result<Self> {
        Ok(Self {
            conn: db::open_in_memory(machine)?,
            machine,
        })
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Insert a batch of jobs in one transaction, silently skipping
    /// duplicates. Never fails on a constraint hit.
    pub fn upsert_batch(&mut self, jobs: &[Job]) -> Result<InsertStats> {
        let tx = self.conn.transaction()?;
        let stats = insert_jobs(&tx, jobs)?;
        tx.commit().context("failed to commit job batch")?;
        Ok(stats)
    }

    /// Atomically replace one day's rows (matched on `date(end)`): delete
    /// then insert inside a single transaction, so readers never observe a
    /// partially rewritten day.
    pub fn replace_day(&mut self, date: NaiveDate, jobs: &[Job]) -> Result<InsertStats> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM jobs WHERE date(\"end\") = ?1",
            params![date.to_string()],
        )?;
        let stats = insert_jobs(&tx, jobs)?;
        tx.commit().context("failed to commit day replacement")?;
        Ok(stats)
    }

    /// Delete one day's rows (matched on `date(end)`).
    pub fn delete_day(&mut self, date: NaiveDate) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM jobs WHERE date(\"end\") = ?1",
            params![date.to_string()],
        )?;
        Ok(n)
    }

    pub fn count_jobs(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?)
    }

    /// Charged jobs matching the filter, computed through the live
    /// charging view.
    pub fn charged_jobs(&self, filter: &JobFilter) -> Result<Vec<ChargedJob>> {
        let mut sql = format!(
            "SELECT {JOB_COLUMNS}, cpu_hours, gpu_hours, memory_hours, charge_hours \
             FROM v_jobs_charged WHERE 1=1"
        );
        let mut values: Vec<SqlValue> = Vec::new();

        for (column, value) in [
            ("user", &filter.user),
            ("account", &filter.account),
            ("queue", &filter.queue),
            ("status", &filter.status),
        ] {
            if let Some(v) = value {
                sql.push_str(&format!(" AND {column} = ?{}", values.len() + 1));
                values.push(SqlValue::Text(v.clone()));
            }
        }
        if let Some(range) = &filter.range {
            let col = filter.date_field.column();
            sql.push_str(&format!(
                " AND {col} >= ?{} AND {col} < ?{}",
                values.len() + 1,
                values.len() + 2
            ));
            values.push(SqlValue::Text(range.start_bound()));
            values.push(SqlValue::Text(range.end_bound()));
        }
        sql.push_str(" ORDER BY \"end\" DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_charged_job)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Sync progress for one day, if any has been recorded.
    pub fn day_status(&self, date: NaiveDate) -> Result<Option<DayStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM sync_state WHERE date = ?1",
                params![date.to_string()],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(status.as_deref().and_then(DayStatus::parse))
    }

    pub fn set_day_status(&mut self, date: NaiveDate, status: DayStatus) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_state (date, status, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(date) DO UPDATE SET status = ?2, updated_at = ?3",
            params![
                date.to_string(),
                status.as_str(),
                chrono::Utc::now().format(db::TS_FORMAT).to_string()
            ],
        )?;
        Ok(())
    }
}

fn insert_jobs(conn: &Connection, jobs: &[Job]) -> Result<InsertStats> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT OR IGNORE INTO jobs ({JOB_COLUMNS}) VALUES \
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)"
    ))?;

    let mut stats = InsertStats::default();
    for job in jobs {
        let quality = if job.quality.is_empty() {
            None
        } else {
            Some(
                job.quality
                    .iter()
                    .map(|q| q.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        };
        let changed = stmt.execute(params![
            job.job_id,
            job.short_id,
            job.name,
            job.user,
            job.account,
            job.queue,
            job.status,
            ts_to_db(job.submit),
            ts_to_db(job.eligible),
            ts_to_db(job.start),
            ts_to_db(job.end),
            job.elapsed,
            job.walltime,
            job.cputime,
            job.numcpus,
            job.numgpus,
            job.numnodes,
            job.mpiprocs,
            job.ompthreads,
            job.reqmem,
            job.memory,
            job.vmemory,
            job.cputype,
            job.gputype,
            job.resources,
            job.ptargets,
            job.cpupercent,
            job.avgcpu,
            job.run_count,
            quality,
        ])?;
        if changed == 1 {
            stats.inserted += 1;
        } else {
            stats.skipped += 1;
        }
    }
    Ok(stats)
}

fn row_to_charged_job(row: &Row<'_>) -> rusqlite::Result<ChargedJob> {
    let quality: Option<String> = row.get(29)?;
    Ok(ChargedJob {
        job: Job {
            job_id: row.get(0)?,
            short_id: row.get(1)?,
            name: row.get(2)?,
            user: row.get(3)?,
            account: row.get(4)?,
            queue: row.get(5)?,
            status: row.get(6)?,
            submit: ts_from_db(row.get(7)?),
            eligible: ts_from_db(row.get(8)?),
            start: ts_from_db(row.get(9)?),
            end: ts_from_db(row.get(10)?),
            elapsed: row.get(11)?,
            walltime: row.get(12)?,
            cputime: row.get(13)?,
            numcpus: row.get(14)?,
            numgpus: row.get(15)?,
            numnodes: row.get(16)?,
            mpiprocs: row.get(17)?,
            ompthreads: row.get(18)?,
            reqmem: row.get(19)?,
            memory: row.get(20)?,
            vmemory: row.get(21)?,
            cputype: row.get(22)?,
            gputype: row.get(23)?,
            resources: row.get(24)?,
            ptargets: row.get(25)?,
            cpupercent: row.get(26)?,
            avgcpu: row.get(27)?,
            run_count: row.get(28)?,
            quality: quality
                .as_deref()
                .map(|s| s.split(',').filter_map(DataQuality::parse).collect())
                .unwrap_or_default(),
        },
        charge: Charge {
            cpu_hours: row.get(30)?,
            gpu_hours: row.get(31)?,
            memory_hours: row.get(32)?,
            charge_hours: row.get(33)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> chrono::DateTime<chrono::Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn sample_job(id: &str, submit: &str) -> Job {
        Job {
            job_id: id.to_string(),
            short_id: Some(100),
            user: Some("alice".into()),
            account: Some("NCAR0001".into()),
            queue: Some("main".into()),
            status: Some("F".into()),
            submit: Some(ts(submit)),
            start: Some(ts("2025-01-15 11:00:00")),
            end: Some(ts("2025-01-15 12:00:00")),
            elapsed: Some(3600),
            numcpus: Some(128),
            numnodes: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_batch_skips_duplicates() {
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        let jobs = vec![
            sample_job("100.sched", "2025-01-15 10:00:00"),
            sample_job("101.sched", "2025-01-15 10:05:00"),
        ];

        let stats = store.upsert_batch(&jobs).unwrap();
        assert_eq!(stats, InsertStats { inserted: 2, skipped: 0 });

        let stats = store.upsert_batch(&jobs).unwrap();
        assert_eq!(stats, InsertStats { inserted: 0, skipped: 2 });
        assert_eq!(store.count_jobs().unwrap(), 2);
    }

    #[test]
    fn test_same_job_id_different_submit_is_distinct() {
        // Identifier wrap-around: same job_id, new scheduler epoch
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        let jobs = vec![
            sample_job("100.sched", "2025-01-15 10:00:00"),
            sample_job("100.sched", "2025-06-20 09:00:00"),
        ];
        let stats = store.upsert_batch(&jobs).unwrap();
        assert_eq!(stats.inserted, 2);
    }

    #[test]
    fn test_charged_jobs_uses_live_view() {
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        store
            .upsert_batch(&[sample_job("100.sched", "2025-01-15 10:00:00")])
            .unwrap();

        let rows = store.charged_jobs(&JobFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        // main queue, production: whole-node billing
        assert_eq!(rows[0].charge.cpu_hours, 128.0);
        assert_eq!(rows[0].charge.charge_hours, 128.0);
    }

    #[test]
    fn test_filter_half_open_range() {
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        let mut at_start = sample_job("100.sched", "2025-01-14 10:00:00");
        at_start.end = Some(ts("2025-01-15 00:00:00"));
        let mut at_end = sample_job("101.sched", "2025-01-15 10:00:00");
        at_end.end = Some(ts("2025-01-16 00:00:00"));
        store.upsert_batch(&[at_start, at_end]).unwrap();

        let filter = JobFilter {
            range: Some(DateRange::new(
                NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 16).unwrap(),
            )),
            ..Default::default()
        };
        let rows = store.charged_jobs(&filter).unwrap();
        // end == start boundary included, end == end boundary excluded
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job.job_id, "100.sched");
    }

    #[test]
    fn test_filter_on_submit_field() {
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        // submitted in January, finished in February
        let mut job = sample_job("100.sched", "2025-01-31 23:00:00");
        job.end = Some(ts("2025-02-01 03:00:00"));
        store.upsert_batch(&[job]).unwrap();

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        );
        let by_end = JobFilter {
            range: Some(range),
            ..Default::default()
        };
        assert_eq!(store.charged_jobs(&by_end).unwrap().len(), 1);

        let by_submit = JobFilter {
            range: Some(range),
            date_field: DateField::Submit,
            ..Default::default()
        };
        assert!(store.charged_jobs(&by_submit).unwrap().is_empty());
    }

    #[test]
    fn test_quality_flags_roundtrip() {
        let mut store = JobStore::open_in_memory(Machine::Casper).unwrap();
        let mut job = sample_job("100.sched", "2025-01-15 10:00:00");
        job.start = None;
        job.flag_quality();
        store.upsert_batch(&[job]).unwrap();

        let rows = store.charged_jobs(&JobFilter::default()).unwrap();
        assert_eq!(rows[0].job.quality, vec![DataQuality::EndWithoutStart]);
    }

    #[test]
    fn test_replace_day_is_complete() {
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        store
            .upsert_batch(&[
                sample_job("100.sched", "2025-01-15 10:00:00"),
                sample_job("101.sched", "2025-01-15 10:05:00"),
            ])
            .unwrap();

        let replacement = vec![sample_job("200.sched", "2025-01-15 11:00:00")];
        store
            .replace_day(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(), &replacement)
            .unwrap();
        assert_eq!(store.count_jobs().unwrap(), 1);
    }

    #[test]
    fn test_day_status_tracking() {
        let mut store = JobStore::open_in_memory(Machine::Derecho).unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        assert_eq!(store.day_status(day).unwrap(), None);

        store.set_day_status(day, DayStatus::Stored).unwrap();
        assert_eq!(store.day_status(day).unwrap(), Some(DayStatus::Stored));

        store.set_day_status(day, DayStatus::Summarized).unwrap();
        assert_eq!(store.day_status(day).unwrap(), Some(DayStatus::Summarized));
    }
}
