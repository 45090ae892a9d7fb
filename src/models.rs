//! Core Data Models
//!
//! This module defines the data structures shared across the job-history
//! pipeline. Data flows through them in this sequence:
//!
//! 1. **Raw Data**: loosely-typed records from the remote source
//! 2. **Normalization**: [`Job`] - one canonical row per scheduler job
//! 3. **Charging**: [`ChargedJob`] - a job annotated with resource-hour costs
//! 4. **Aggregation**: [`DailySummary`] - per day/user/account/queue rollups
//!
//! ## Identity
//!
//! Scheduler job identifiers wrap around across epochs, so `(job_id, submit)`
//! is the unique key per machine store. Array tasks keep the full identifier
//! (e.g. `6049117[28]`) in `job_id` while [`Job::short_id`] carries the base
//! number so array tasks can be grouped under one logical submission.
//!
//! ## Absent vs zero
//!
//! Numeric fields are `Option` throughout: a job that reports 0 GPUs is
//! different from a job that never reported a GPU count. Charging is the one
//! place where absent collapses to zero, and that happens in
//! [`crate::charging`], not here.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A machine whose job history we collect. Each machine owns its own
/// database file; nothing is ever joined across machines below the
/// reporting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Machine {
    Derecho,
    Casper,
}

/// Charging policy family for a machine.
///
/// Node-allocated clusters bill whole nodes on production queues;
/// shared-node clusters bill actual requested resources on three axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineFamily {
    NodeAllocated,
    SharedNode,
}

impl Machine {
    pub const ALL: [Machine; 2] = [Machine::Derecho, Machine::Casper];

    pub fn name(&self) -> &'static str {
        match self {
            Machine::Derecho => "derecho",
            Machine::Casper => "casper",
        }
    }

    pub fn family(&self) -> MachineFamily {
        match self {
            Machine::Derecho => MachineFamily::NodeAllocated,
            Machine::Casper => MachineFamily::SharedNode,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Machine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "derecho" => Ok(Machine::Derecho),
            "casper" => Ok(Machine::Casper),
            other => anyhow::bail!("unknown machine: {other} (expected 'derecho' or 'casper')"),
        }
    }
}

/// Data-quality anomalies detected during normalization.
///
/// Flagged records are stored anyway; queries must tolerate them (e.g. a
/// missing `start` makes wait-time metrics undefined rather than zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataQuality {
    /// `end` is set but `start` never was.
    EndWithoutStart,
    /// `start` precedes `submit` (clock skew or epoch wraparound upstream).
    StartBeforeSubmit,
    /// A timestamp decoded to the UNIX epoch, which the scheduler emits
    /// very rarely for corrupted accounting records.
    EpochTimestamp,
}

impl DataQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::EndWithoutStart => "end_without_start",
            DataQuality::StartBeforeSubmit => "start_before_submit",
            DataQuality::EpochTimestamp => "epoch_timestamp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_without_start" => Some(DataQuality::EndWithoutStart),
            "start_before_submit" => Some(DataQuality::StartBeforeSubmit),
            "epoch_timestamp" => Some(DataQuality::EpochTimestamp),
            _ => None,
        }
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One job record as stored in the `jobs` table.
///
/// All timestamps are UTC. Durations are seconds, memory fields are bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Full scheduler identifier, array index included (e.g. `6049117[28].desched1`).
    pub job_id: String,
    /// Base job number with any array index stripped.
    pub short_id: Option<i64>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub account: Option<String>,
    pub queue: Option<String>,
    pub status: Option<String>,

    pub submit: Option<DateTime<Utc>>,
    pub eligible: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,

    pub elapsed: Option<i64>,
    pub walltime: Option<i64>,
    pub cputime: Option<i64>,

    pub numcpus: Option<i64>,
    pub numgpus: Option<i64>,
    pub numnodes: Option<i64>,
    pub mpiprocs: Option<i64>,
    pub ompthreads: Option<i64>,

    pub reqmem: Option<i64>,
    pub memory: Option<i64>,
    pub vmemory: Option<i64>,

    pub cputype: Option<String>,
    pub gputype: Option<String>,
    pub resources: Option<String>,
    pub ptargets: Option<String>,

    pub cpupercent: Option<f64>,
    pub avgcpu: Option<f64>,
    pub run_count: Option<i64>,

    /// Data-quality flags attached at normalization time.
    pub quality: Vec<DataQuality>,
}

impl Job {
    /// Validate temporal ordering and record anomalies as quality flags.
    ///
    /// Records are never rejected here: malformed ordering is a warning the
    /// query layer has to live with, not an ingestion failure.
    pub fn flag_quality(&mut self) {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        self.quality.clear();
        if self.end.is_some() && self.start.is_none() {
            self.quality.push(DataQuality::EndWithoutStart);
        }
        if let (Some(submit), Some(start)) = (self.submit, self.start) {
            if start < submit {
                self.quality.push(DataQuality::StartBeforeSubmit);
            }
        }
        if [self.submit, self.eligible, self.start, self.end]
            .iter()
            .any(|t| *t == Some(epoch))
        {
            self.quality.push(DataQuality::EpochTimestamp);
        }
    }
}

/// Resource-hour costs for one job under the active charging policy.
///
/// Never persisted: always derived from [`Job`] plus the machine's rules so
/// a rule change can never leave stale charges behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Charge {
    pub cpu_hours: f64,
    pub gpu_hours: f64,
    pub memory_hours: f64,
    /// Single billing axis for node-allocated machines: GPU-hours on GPU
    /// queues, CPU-hours otherwise. Zero on shared-node machines.
    pub charge_hours: f64,
}

/// A job together with its computed charges, as read from the
/// `v_jobs_charged` view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargedJob {
    #[serde(flatten)]
    pub job: Job,
    #[serde(flatten)]
    pub charge: Charge,
}

/// One row of the `daily_summary` table: per-day totals for a
/// `(user, account, queue)` tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub user: String,
    pub account: String,
    pub queue: String,
    pub job_count: i64,
    pub charge_hours: f64,
    pub cpu_hours: f64,
    pub gpu_hours: f64,
    pub memory_hours: f64,
}

/// Half-open date range `[start, end)` compared at day boundaries.
///
/// A job ending exactly at midnight of `end` is outside the range; one
/// ending exactly at midnight of `start` is inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Lower bound as a database timestamp string (inclusive).
    pub fn start_bound(&self) -> String {
        format!("{} 00:00:00", self.start)
    }

    /// Upper bound as a database timestamp string (exclusive).
    pub fn end_bound(&self) -> String {
        format!("{} 00:00:00", self.end)
    }
}

/// Which timestamp column a date filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateField {
    #[default]
    End,
    Submit,
}

impl DateField {
    pub fn column(&self) -> &'static str {
        match self {
            DateField::End => "\"end\"",
            DateField::Submit => "submit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_machine_parsing() {
        assert_eq!("derecho".parse::<Machine>().unwrap(), Machine::Derecho);
        assert_eq!("CASPER".parse::<Machine>().unwrap(), Machine::Casper);
        assert!("cheyenne".parse::<Machine>().is_err());
    }

    #[test]
    fn test_quality_end_without_start() {
        let mut job = Job {
            job_id: "1.sched".into(),
            end: Some(ts("2025-01-15 12:00:00")),
            ..Default::default()
        };
        job.flag_quality();
        assert_eq!(job.quality, vec![DataQuality::EndWithoutStart]);
    }

    #[test]
    fn test_quality_start_before_submit() {
        let mut job = Job {
            job_id: "2.sched".into(),
            submit: Some(ts("2025-01-15 12:00:00")),
            start: Some(ts("2025-01-15 11:00:00")),
            end: Some(ts("2025-01-15 13:00:00")),
            ..Default::default()
        };
        job.flag_quality();
        assert_eq!(job.quality, vec![DataQuality::StartBeforeSubmit]);
    }

    #[test]
    fn test_quality_clean_record() {
        let mut job = Job {
            job_id: "3.sched".into(),
            submit: Some(ts("2025-01-15 10:00:00")),
            start: Some(ts("2025-01-15 11:00:00")),
            end: Some(ts("2025-01-15 12:00:00")),
            ..Default::default()
        };
        job.flag_quality();
        assert!(job.quality.is_empty());
    }

    #[test]
    fn test_quality_roundtrip_labels() {
        for q in [
            DataQuality::EndWithoutStart,
            DataQuality::StartBeforeSubmit,
            DataQuality::EpochTimestamp,
        ] {
            assert_eq!(DataQuality::parse(q.as_str()), Some(q));
        }
    }
}
