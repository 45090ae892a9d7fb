//! Database bootstrap: per-machine SQLite files, schema, and the charging view.
//!
//! Each machine gets its own database file under the configured data
//! directory (overridable per machine with `JOBHIST_<MACHINE>_DB`). The
//! schema is created idempotently on open; the charging view is dropped and
//! recreated every time so a rule change in [`crate::charging`] takes
//! effect immediately and can never serve stale formulas.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use std::env;
use std::path::PathBuf;

use crate::charging::charged_view_sql;
use crate::config::get_config;
use crate::models::Machine;

/// Timestamp text format used in the database. Plain UTC wall-clock text
/// keeps SQLite's `date()`/`strftime()` and lexicographic comparison usable.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn ts_to_db(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.format(TS_FORMAT).to_string())
}

pub fn ts_from_db(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| NaiveDateTime::parse_from_str(&s, TS_FORMAT).ok())
        .map(|n| n.and_utc())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      TEXT NOT NULL,
    short_id    INTEGER,
    name        TEXT,
    user        TEXT,
    account     TEXT,
    queue       TEXT,
    status      TEXT,
    submit      TEXT,
    eligible    TEXT,
    start       TEXT,
    \"end\"     TEXT,
    elapsed     INTEGER,
    walltime    INTEGER,
    cputime     INTEGER,
    numcpus     INTEGER,
    numgpus     INTEGER,
    numnodes    INTEGER,
    mpiprocs    INTEGER,
    ompthreads  INTEGER,
    reqmem      INTEGER,
    memory      INTEGER,
    vmemory     INTEGER,
    cputype     TEXT,
    gputype     TEXT,
    resources   TEXT,
    ptargets    TEXT,
    cpupercent  REAL,
    avgcpu      REAL,
    run_count   INTEGER,
    quality     TEXT
);

-- Same job_id + submit time = same job; handles id wrap-around across epochs
CREATE UNIQUE INDEX IF NOT EXISTS uq_jobs_job_id_submit ON jobs(job_id, submit);

CREATE INDEX IF NOT EXISTS ix_jobs_job_id  ON jobs(job_id);
CREATE INDEX IF NOT EXISTS ix_jobs_short_id ON jobs(short_id);
CREATE INDEX IF NOT EXISTS ix_jobs_user    ON jobs(user);
CREATE INDEX IF NOT EXISTS ix_jobs_account ON jobs(account);
CREATE INDEX IF NOT EXISTS ix_jobs_queue   ON jobs(queue);
CREATE INDEX IF NOT EXISTS ix_jobs_status  ON jobs(status);
CREATE INDEX IF NOT EXISTS ix_jobs_submit  ON jobs(submit);
CREATE INDEX IF NOT EXISTS ix_jobs_start   ON jobs(start);
CREATE INDEX IF NOT EXISTS ix_jobs_end     ON jobs(\"end\");

-- Composite indexes for date-filtered aggregation
CREATE INDEX IF NOT EXISTS ix_jobs_user_submit    ON jobs(user, submit);
CREATE INDEX IF NOT EXISTS ix_jobs_account_submit ON jobs(account, submit);
CREATE INDEX IF NOT EXISTS ix_jobs_queue_submit   ON jobs(queue, submit);
CREATE INDEX IF NOT EXISTS ix_jobs_submit_end     ON jobs(submit, \"end\");

CREATE TABLE IF NOT EXISTS daily_summary (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    date         TEXT NOT NULL,
    user         TEXT NOT NULL,
    account      TEXT NOT NULL,
    queue        TEXT NOT NULL,
    job_count    INTEGER NOT NULL DEFAULT 0,
    charge_hours REAL NOT NULL DEFAULT 0,
    cpu_hours    REAL NOT NULL DEFAULT 0,
    gpu_hours    REAL NOT NULL DEFAULT 0,
    memory_hours REAL NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_daily_summary
    ON daily_summary(date, user, account, queue);
CREATE INDEX IF NOT EXISTS ix_daily_summary_date ON daily_summary(date);
CREATE INDEX IF NOT EXISTS ix_daily_summary_user_account ON daily_summary(user, account);

-- Per-day sync progress: 'stored' or 'summarized'
CREATE TABLE IF NOT EXISTS sync_state (
    date       TEXT PRIMARY KEY,
    status     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Database file path for a machine.
///
/// `JOBHIST_DERECHO_DB` / `JOBHIST_CASPER_DB` override the configured data
/// directory, which tests and one-off analyses rely on.
pub fn db_path(machine: Machine) -> PathBuf {
    let env_var = format!("JOBHIST_{}_DB", machine.name().to_uppercase());
    if let Ok(path) = env::var(&env_var) {
        return PathBuf::from(path);
    }
    get_config()
        .paths
        .data_dir
        .join(format!("{}.db", machine.name()))
}

/// Open (creating if needed) the database for a machine.
pub fn open(machine: Machine) -> Result<Connection> {
    let path = db_path(machine);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let conn = Connection::open(&path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_schema(&conn, machine)?;
    Ok(conn)
}

/// Open an in-memory database with the full schema (tests).
pub fn open_in_memory(machine: Machine) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn, machine)?;
    Ok(conn)
}

fn init_schema(conn: &Connection, machine: Machine) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("failed to initialize jobs schema")?;
    // SQLite has no CREATE OR REPLACE VIEW
    conn.execute_batch("DROP VIEW IF EXISTS v_jobs_charged;")?;
    conn.execute_batch(&charged_view_sql(machine))
        .context("failed to create charging view")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_cleanly_for_both_machines() {
        for machine in Machine::ALL {
            let conn = open_in_memory(machine).unwrap();
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM v_jobs_charged", [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0);
        }
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let dt = ts_from_db(Some("2025-01-15 12:30:00".to_string())).unwrap();
        assert_eq!(ts_to_db(Some(dt)).unwrap(), "2025-01-15 12:30:00");
        assert_eq!(ts_to_db(None), None);
        assert_eq!(ts_from_db(None), None);
    }
}
