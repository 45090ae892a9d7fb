//! Jobhist Library
//!
//! Collects historical HPC job-accounting records from remote clusters
//! into per-machine SQLite databases and answers usage questions over
//! them: who ran what, how much it cost under the machine's charging
//! policy, and how usage trends over days, months, and quarters.
//!
//! ## Architecture Overview
//!
//! The library is organized around several key modules:
//!
//! - [`models`] - Core data structures: machines, jobs, charges, summaries
//! - [`parsers`] - Normalization of raw qhist records into canonical jobs
//! - [`charging`] - Queue classification and resource-hour charging rules
//! - [`db`] / [`store`] - Per-machine SQLite schema and the job store
//! - [`remote`] - The SSH/qhist job-history source
//! - [`sync`] - Day-granular idempotent synchronization
//! - [`summary`] - Daily rollup table maintenance
//! - [`queries`] - Grouped totals, bucket histograms, time series
//! - [`report`] - Fixed-width/JSON/CSV/markdown rendering
//! - [`config`] - Configuration management with environment variable support
//! - [`logging`] - Structured logging with JSON and pretty-print formats
//!
//! ## Data Flow
//!
//! remote source → [`parsers`] → [`store`] (idempotent upsert) →
//! [`summary`] per-day rollup → [`queries`] → [`report`].
//!
//! One store per machine; machines never share storage or identifiers.

pub mod charging;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod parsers;
pub mod queries;
pub mod remote;
pub mod report;
pub mod store;
pub mod summary;
pub mod sync;

pub use models::{ChargedJob, DailySummary, DateRange, Job, Machine};
pub use store::JobStore;
