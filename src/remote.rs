//! Remote job-history source.
//!
//! The synchronizer talks to the outside world through [`JobSource`], an
//! opaque "give me a machine and a day, get raw records back" contract.
//! Production uses [`SshSource`], which shells out to `qhist` on the remote
//! login node; tests substitute an in-memory fake.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::FetchError;
use crate::models::Machine;
use crate::parsers::ALL_FIELDS;

/// Default ceiling on one remote call. A wedged login node must not hang a
/// whole range sync; past this the day is marked failed and the range moves on.
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(300);

/// One raw job record as produced by the source, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawJobRecord {
    /// Identifier from the JSON envelope key (e.g. `2712367.desched1`),
    /// which is the only array-index-preserving form the source emits.
    pub full_id: Option<String>,
    /// The record body, a loosely-typed field map.
    pub fields: Value,
}

/// Contract for fetching one day of job history from a machine.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_day(
        &self,
        machine: Machine,
        date: NaiveDate,
    ) -> Result<Vec<RawJobRecord>, FetchError>;
}

/// Fetches job history by running `qhist -J` over SSH with a bounded timeout.
pub struct SshSource {
    timeout: Duration,
}

impl SshSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SshSource {
    fn default() -> Self {
        Self::new(DEFAULT_SSH_TIMEOUT)
    }
}

#[async_trait]
impl JobSource for SshSource {
    async fn fetch_day(
        &self,
        machine: Machine,
        date: NaiveDate,
    ) -> Result<Vec<RawJobRecord>, FetchError> {
        let period = date.format("%Y%m%d").to_string();
        debug!(machine = %machine, %period, "running remote qhist");

        let mut command = Command::new("ssh");
        command
            .arg(machine.name())
            .arg("qhist")
            .arg("-J")
            .arg(format!("-f={ALL_FIELDS}"))
            .arg("-p")
            .arg(&period);
        let output = bounded_output(command, self.timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Command(stderr.trim().to_string()));
        }

        parse_qhist_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Run a command with a hard deadline. The child is killed when the
/// deadline drops the future; on timeout nothing keeps running against the
/// remote host.
async fn bounded_output(
    mut command: Command,
    timeout: Duration,
) -> Result<std::process::Output, FetchError> {
    command.kill_on_drop(true);
    tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
        .map_err(FetchError::from)
}

/// Parse the qhist JSON envelope: `{"Jobs": {"<full id>": {...}, ...}}`.
/// Empty output means the day simply has no records.
pub fn parse_qhist_json(stdout: &str) -> Result<Vec<RawJobRecord>, FetchError> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }

    let data: Value = serde_json::from_str(stdout)
        .map_err(|e| FetchError::Payload(format!("invalid JSON from qhist: {e}")))?;

    let jobs = match data.get("Jobs") {
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(FetchError::Payload("'Jobs' is not an object".to_string()));
        }
        None => return Ok(Vec::new()),
    };

    Ok(jobs
        .iter()
        .map(|(full_id, fields)| RawJobRecord {
            full_id: Some(full_id.clone()),
            fields: fields.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let records = parse_qhist_json(
            r#"{"timestamp": "2025-01-15", "Jobs": {
                "100.desched1": {"user": "alice"},
                "101.desched1": {"user": "bob"}
            }}"#,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .any(|r| r.full_id.as_deref() == Some("100.desched1")));
    }

    #[test]
    fn test_empty_output_is_zero_records() {
        assert!(parse_qhist_json("").unwrap().is_empty());
        assert!(parse_qhist_json("{\"Jobs\": {}}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_command_leaves_no_child_behind() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(format!("sleep 0.4 && touch {}", marker.display()));

        let err = bounded_output(command, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));

        // If the child had been detached it would touch the marker shortly
        // after the deadline.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_malformed_json_is_payload_error() {
        let err = parse_qhist_json("{not json").unwrap_err();
        assert!(matches!(err, FetchError::Payload(_)));
    }
}
