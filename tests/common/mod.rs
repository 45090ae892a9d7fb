//! Shared fixtures: an in-memory job-history source and job builders.
#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::json;

use jobhist::error::FetchError;
use jobhist::models::{Job, Machine};
use jobhist::remote::{JobSource, RawJobRecord};

pub fn ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .unwrap()
        .and_utc()
}

pub fn day(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

/// A finished one-hour, one-node job ending at the given instant.
pub fn finished_job(id: &str, user: &str, queue: &str, end: &str) -> Job {
    let end = ts(end);
    Job {
        job_id: id.to_string(),
        user: Some(user.into()),
        account: Some("NCAR0001".into()),
        queue: Some(queue.into()),
        status: Some("F".into()),
        submit: Some(end - chrono::Duration::hours(3)),
        eligible: Some(end - chrono::Duration::hours(3)),
        start: Some(end - chrono::Duration::hours(1)),
        end: Some(end),
        elapsed: Some(3600),
        numcpus: Some(64),
        numgpus: Some(0),
        numnodes: Some(1),
        reqmem: Some(8 * 1024 * 1024 * 1024),
        memory: Some(4 * 1024 * 1024 * 1024),
        ..Default::default()
    }
}

/// Raw record in the qhist JSON shape, keyed and timed so it lands on
/// `end_day` with a stable `(job_id, submit)` identity.
pub fn raw_record(id: u64, user: &str, end_day: &str) -> RawJobRecord {
    RawJobRecord {
        full_id: Some(format!("{id}.desched1")),
        fields: json!({
            "user": user,
            "account": "NCAR0001",
            "queue": "main",
            "Exit_status": "0",
            "ctime": format!("{end_day} 06:00:00"),
            "etime": format!("{end_day} 06:00:00"),
            "start": format!("{end_day} 08:00:00"),
            "end": format!("{end_day} 09:00:00"),
            "Resource_List": {"ncpus": "128", "nodect": "1", "ngpus": "0"},
            "resources_used": {"walltime": "1.0"},
        }),
    }
}

/// Canned per-day qhist responses.
#[derive(Default)]
pub struct FakeSource {
    pub days: HashMap<NaiveDate, Vec<RawJobRecord>>,
}

impl FakeSource {
    pub fn with_day(mut self, date: &str, records: Vec<RawJobRecord>) -> Self {
        self.days.insert(day(date), records);
        self
    }
}

#[async_trait]
impl JobSource for FakeSource {
    async fn fetch_day(
        &self,
        _machine: Machine,
        date: NaiveDate,
    ) -> Result<Vec<RawJobRecord>, FetchError> {
        Ok(self.days.get(&date).cloned().unwrap_or_default())
    }
}
