//! Record normalization: raw source output to canonical [`Job`] values.
//!
//! The remote `qhist` command reports either a nested JSON object per job or
//! a tab-separated columnar line. Both shapes funnel through
//! [`normalize_record`], which is a pure function: no I/O, no database.
//!
//! Field parsing is defensive everywhere except the identifier. A record
//! without a job id is useless and is rejected with
//! [`ParseError::MissingJobId`]; any other absent, empty, or garbage field
//! becomes `None`. Zero is a real observed value (0 GPUs is not the same as
//! "GPUs not reported"), so nothing defaults to zero here.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::Denver;
use serde_json::Value;

use crate::error::ParseError;
use crate::models::Job;
use crate::remote::RawJobRecord;

/// Every field the source can report, in columnar order.
pub const ALL_FIELDS: &str = "id,short_id,account,avgcpu,count,cpupercent,cputime,cputype,\
elapsed,eligible,end,gputype,memory,mpiprocs,name,numcpus,\
numgpus,numnodes,ompthreads,ptargets,queue,reqmem,resources,\
start,status,submit,user,vmemory,walltime";

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Parse a YYYY-MM-DD string.
pub fn parse_date_string(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("invalid date: {s} (expected YYYY-MM-DD)"))
}

/// Iterate calendar days from `start` to `end`, both inclusive.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let days = (end - start).num_days().max(-1);
    (0..=days).map(move |d| start + Duration::days(d))
}

/// Parse a timestamp string and convert to UTC.
///
/// The source reports in the cluster's civil time zone (America/Denver)
/// without an offset, so naive timestamps go through a proper zoned
/// conversion: tagging them as UTC directly would be off by six or seven
/// hours depending on the time of year. An ambiguous local time during the
/// fall-back transition resolves to the earlier offset; a nonexistent local
/// time inside the spring-forward gap resolves to the post-transition
/// instant rather than being dropped.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    const ZONED_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S%z"];

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            let resolved = match Denver.from_local_datetime(&naive) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earlier, _) => Some(earlier),
                // The transition skips exactly one hour in this zone.
                LocalResult::None => Denver
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest(),
            };
            return resolved.map(|dt| dt.with_timezone(&Utc));
        }
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    None
}

/// Parse an integer from a string or number value; anything else is unknown.
pub fn parse_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !s.is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn parse_float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the base job number from an identifier, stripping any array
/// index: `"6049117[28]"` parses to `6049117`.
pub fn parse_short_id(value: &str) -> Option<i64> {
    let base = value.split(['[', '.']).next()?;
    base.trim().parse().ok()
}

/// Hours-valued durations (`walltime`, `cput`) to whole seconds.
fn hours_to_seconds(value: Option<&Value>) -> Option<i64> {
    parse_float(value).map(|h| (h * 3600.0) as i64)
}

/// GB-valued memory fields to bytes.
fn gb_to_bytes(value: Option<&Value>) -> Option<i64> {
    parse_float(value).map(|gb| (gb * BYTES_PER_GB) as i64)
}

/// Pull `mpiprocs=` / `ompthreads=` out of a PBS select string like
/// `1:ncpus=128:mpiprocs=128:ompthreads=1`.
fn parse_select_string(select: &str) -> (Option<i64>, Option<i64>) {
    let mut mpiprocs = None;
    let mut ompthreads = None;
    for part in select.split(':') {
        if let Some(v) = part.strip_prefix("mpiprocs=") {
            mpiprocs = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("ompthreads=") {
            ompthreads = v.parse().ok();
        }
    }
    (mpiprocs, ompthreads)
}

/// Normalize one raw record into a canonical [`Job`].
///
/// Dispatches on shape: records carrying a nested `Resource_List` are the
/// JSON form straight from the source; flat records are the columnar form
/// (already in seconds and bytes).
pub fn normalize_record(raw: &RawJobRecord) -> Result<Job, ParseError> {
    let mut job = if raw.fields.get("Resource_List").is_some()
        || raw.fields.get("resources_used").is_some()
    {
        normalize_json_record(raw)?
    } else {
        normalize_columnar_record(raw)?
    };
    job.flag_quality();
    Ok(job)
}

fn normalize_json_record(raw: &RawJobRecord) -> Result<Job, ParseError> {
    let rec = &raw.fields;
    let empty = Value::Object(Default::default());
    let resource_list = rec.get("Resource_List").unwrap_or(&empty);
    let resources_used = rec.get("resources_used").unwrap_or(&empty);

    let select = value_str(resource_list.get("select"));
    let (mpiprocs, ompthreads) = select
        .as_deref()
        .map(parse_select_string)
        .unwrap_or((None, None));

    // The array-aware identifier lives in the envelope key; the record's own
    // short_id field may still carry the array index.
    let raw_short_id = value_str(rec.get("short_id"));
    let job_id = raw
        .full_id
        .clone()
        .or_else(|| raw_short_id.clone())
        .ok_or(ParseError::MissingJobId)?;

    let ts = |v: Option<&Value>| value_str(v).as_deref().and_then(parse_timestamp);

    Ok(Job {
        short_id: raw_short_id.as_deref().and_then(parse_short_id),
        job_id,
        name: value_str(rec.get("jobname")),
        user: value_str(rec.get("user")),
        account: value_str(rec.get("account")),
        queue: value_str(rec.get("queue")),
        status: value_str(rec.get("Exit_status")),

        // ctime=submit, etime=eligible in scheduler parlance
        submit: ts(rec.get("ctime")),
        eligible: ts(rec.get("etime")),
        start: ts(rec.get("start")),
        end: ts(rec.get("end")),

        elapsed: hours_to_seconds(resources_used.get("walltime")),
        walltime: hours_to_seconds(resource_list.get("walltime")),
        cputime: hours_to_seconds(resources_used.get("cput")),

        numcpus: parse_int(resource_list.get("ncpus")),
        numgpus: parse_int(resource_list.get("ngpus")),
        numnodes: parse_int(resource_list.get("nodect")),
        mpiprocs,
        ompthreads,

        reqmem: gb_to_bytes(resource_list.get("mem")),
        memory: gb_to_bytes(resources_used.get("mem")),
        vmemory: gb_to_bytes(resources_used.get("vmem")),

        // Hardware types are not present in the JSON shape
        cputype: None,
        gputype: None,
        resources: select,
        ptargets: value_str(resource_list.get("preempt_targets")),

        cpupercent: parse_float(resources_used.get("cpupercent")),
        avgcpu: parse_float(resources_used.get("avgcpu")),
        run_count: parse_int(rec.get("run_count")),

        quality: Vec::new(),
    })
}

fn normalize_columnar_record(raw: &RawJobRecord) -> Result<Job, ParseError> {
    let rec = &raw.fields;
    let id = value_str(rec.get("id"))
        .or_else(|| raw.full_id.clone())
        .ok_or(ParseError::MissingJobId)?;

    let ts = |key: &str| value_str(rec.get(key)).as_deref().and_then(parse_timestamp);

    Ok(Job {
        short_id: value_str(rec.get("short_id"))
            .as_deref()
            .or(Some(id.as_str()))
            .and_then(parse_short_id),
        job_id: id,
        name: value_str(rec.get("name")),
        user: value_str(rec.get("user")),
        account: value_str(rec.get("account")),
        queue: value_str(rec.get("queue")),
        status: value_str(rec.get("status")),

        submit: ts("submit"),
        eligible: ts("eligible"),
        start: ts("start"),
        end: ts("end"),

        elapsed: parse_int(rec.get("elapsed")),
        walltime: parse_int(rec.get("walltime")),
        cputime: parse_int(rec.get("cputime")),

        numcpus: parse_int(rec.get("numcpus")),
        numgpus: parse_int(rec.get("numgpus")),
        numnodes: parse_int(rec.get("numnodes")),
        mpiprocs: parse_int(rec.get("mpiprocs")),
        ompthreads: parse_int(rec.get("ompthreads")),

        reqmem: parse_int(rec.get("reqmem")),
        memory: parse_int(rec.get("memory")),
        vmemory: parse_int(rec.get("vmemory")),

        cputype: value_str(rec.get("cputype")),
        gputype: value_str(rec.get("gputype")),
        resources: value_str(rec.get("resources")),
        ptargets: value_str(rec.get("ptargets")),

        cpupercent: parse_float(rec.get("cpupercent")),
        avgcpu: parse_float(rec.get("avgcpu")),
        run_count: parse_int(rec.get("count")),

        quality: Vec::new(),
    })
}

/// Split one tab-separated columnar line into a raw record using
/// [`ALL_FIELDS`] order. Missing trailing columns are simply absent.
pub fn columnar_line_to_record(line: &str) -> RawJobRecord {
    let mut fields = serde_json::Map::new();
    for (name, value) in ALL_FIELDS.split(',').zip(line.split('\t')) {
        let value = value.trim();
        if !value.is_empty() && value != "-" {
            fields.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    RawJobRecord {
        full_id: None,
        fields: Value::Object(fields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(fields: Value) -> RawJobRecord {
        RawJobRecord {
            full_id: Some("2712367.desched1".into()),
            fields,
        }
    }

    #[test]
    fn test_parse_timestamp_applies_mountain_offset() {
        // January: MST, UTC-7
        let dt = parse_timestamp("2025-01-15T12:00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-15T19:00:00+00:00");
        // July: MDT, UTC-6
        let dt = parse_timestamp("2025-07-15T12:00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-07-15T18:00:00+00:00");
    }

    #[test]
    fn test_parse_timestamp_resolves_spring_forward_gap() {
        // 02:30 on 2025-03-09 does not exist in America/Denver; it resolves
        // to 03:30 MDT, the same instant as 02:30 read with the pre-gap
        // offset.
        let dt = parse_timestamp("2025-03-09T02:30:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-03-09T09:30:00+00:00");
    }

    #[test]
    fn test_parse_timestamp_respects_explicit_offset() {
        let dt = parse_timestamp("2025-01-15T12:00:00+00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-15T12:00:00+00:00");
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not-a-date").is_none());
    }

    #[test]
    fn test_parse_int_distinguishes_zero_from_absent() {
        assert_eq!(parse_int(Some(&json!(0))), Some(0));
        assert_eq!(parse_int(Some(&json!("0"))), Some(0));
        assert_eq!(parse_int(Some(&json!(""))), None);
        assert_eq!(parse_int(Some(&json!("n/a"))), None);
        assert_eq!(parse_int(None), None);
    }

    #[test]
    fn test_parse_short_id_strips_array_index() {
        assert_eq!(parse_short_id("6049117[28]"), Some(6049117));
        assert_eq!(parse_short_id("2712367.desched1"), Some(2712367));
        assert_eq!(parse_short_id("2712367"), Some(2712367));
        assert_eq!(parse_short_id("garbage"), None);
    }

    #[test]
    fn test_normalize_json_record() {
        let rec = raw(json!({
            "short_id": "2712367",
            "jobname": "wrf_run",
            "user": "alice",
            "account": "NCAR0001",
            "queue": "main",
            "Exit_status": "0",
            "ctime": "2025-01-15T10:00:00",
            "start": "2025-01-15T11:00:00",
            "end": "2025-01-15T12:00:00",
            "Resource_List": {
                "ncpus": "128",
                "nodect": "1",
                "walltime": "2.0",
                "mem": "4.0",
                "select": "1:ncpus=128:mpiprocs=64:ompthreads=2"
            },
            "resources_used": {
                "walltime": "1.0",
                "mem": "2.0",
                "cpupercent": "98.5"
            }
        }));

        let job = normalize_record(&rec).unwrap();
        assert_eq!(job.job_id, "2712367.desched1");
        assert_eq!(job.short_id, Some(2712367));
        assert_eq!(job.user.as_deref(), Some("alice"));
        assert_eq!(job.elapsed, Some(3600));
        assert_eq!(job.walltime, Some(7200));
        assert_eq!(job.memory, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(job.reqmem, Some(4 * 1024 * 1024 * 1024));
        assert_eq!(job.mpiprocs, Some(64));
        assert_eq!(job.ompthreads, Some(2));
        assert_eq!(job.cpupercent, Some(98.5));
        // UTC conversion happened: 10:00 MST is 17:00 UTC
        assert_eq!(
            job.submit.unwrap().to_rfc3339(),
            "2025-01-15T17:00:00+00:00"
        );
        assert!(job.quality.is_empty());
    }

    #[test]
    fn test_normalize_array_task_keeps_full_id() {
        let rec = RawJobRecord {
            full_id: Some("6049117[28].desched1".into()),
            fields: json!({
                "short_id": "6049117[28]",
                "Resource_List": {},
                "resources_used": {}
            }),
        };
        let job = normalize_record(&rec).unwrap();
        assert_eq!(job.job_id, "6049117[28].desched1");
        assert_eq!(job.short_id, Some(6049117));
    }

    #[test]
    fn test_missing_identifier_rejects_record() {
        let rec = RawJobRecord {
            full_id: None,
            fields: json!({"Resource_List": {}, "user": "bob"}),
        };
        assert_eq!(normalize_record(&rec), Err(ParseError::MissingJobId));
    }

    #[test]
    fn test_bad_field_degrades_to_unknown_without_rejecting() {
        let rec = raw(json!({
            "short_id": "100",
            "Resource_List": {"ncpus": "lots"},
            "resources_used": {}
        }));
        let job = normalize_record(&rec).unwrap();
        assert_eq!(job.numcpus, None);
    }

    #[test]
    fn test_end_without_start_is_flagged_not_dropped() {
        let rec = raw(json!({
            "short_id": "100",
            "ctime": "2025-01-15T10:00:00",
            "end": "2025-01-15T12:00:00",
            "Resource_List": {},
            "resources_used": {}
        }));
        let job = normalize_record(&rec).unwrap();
        assert_eq!(job.quality, vec![crate::models::DataQuality::EndWithoutStart]);
    }

    #[test]
    fn test_columnar_line() {
        // id, short_id, account columns per ALL_FIELDS order
        let line = "2712367.desched1\t2712367\tNCAR0001";
        let rec = columnar_line_to_record(line);
        let job = normalize_record(&rec).unwrap();
        assert_eq!(job.job_id, "2712367.desched1");
        assert_eq!(job.short_id, Some(2712367));
        assert_eq!(job.account.as_deref(), Some("NCAR0001"));
        assert_eq!(job.numcpus, None);
    }

    #[test]
    fn test_date_range_inclusive() {
        let days: Vec<_> = date_range(
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 2).unwrap(),
        )
        .collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days[0].to_string(), "2025-01-30");
        assert_eq!(days[3].to_string(), "2025-02-02");
    }
}
