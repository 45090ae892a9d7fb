//! Typed failure taxonomy for ingestion.
//!
//! Transport and parse failures are the two classes the synchronizer has to
//! tell apart: a transport failure marks the whole day failed, a parse
//! failure drops a single record and counts it. Everything else rides on
//! `anyhow` at the application boundary.

use std::time::Duration;
use thiserror::Error;

/// Failure reaching or reading the remote job-history source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote command failed: {0}")]
    Command(String),

    #[error("malformed job payload: {0}")]
    Payload(String),

    #[error("failed to spawn remote command: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure normalizing a single raw record.
///
/// Only one condition rejects a record outright; every other bad field
/// degrades to "unknown" on its own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("record has no job identifier")]
    MissingJobId,
}
