use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use jobhist::config::get_config;
use jobhist::logging::init_logging;
use jobhist::models::{DateRange, Machine};
use jobhist::parsers::parse_date_string;
use jobhist::queries::{
    self, BucketMetric, Dimension, Granularity, ResourceFamily,
};
use jobhist::remote::SshSource;
use jobhist::report::{render, ColumnSpec, ReportFormat, ReportRow};
use jobhist::store::JobStore;
use jobhist::sync::{sync_range, DayOutcome, SyncOptions};
use jobhist::{db, summary};

#[derive(Parser)]
#[command(name = "jobhist")]
#[command(about = "Collects HPC job history into per-machine databases and reports on usage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ReportArgs {
    /// Machine name (derecho or casper)
    #[arg(short, long)]
    machine: String,
    /// Start date, inclusive (YYYY-MM-DD)
    #[arg(long)]
    start: String,
    /// End date, exclusive (YYYY-MM-DD)
    #[arg(long)]
    end: String,
    /// Output format: dat, json, csv, or md
    #[arg(long, default_value = "dat")]
    format: String,
    /// Write the report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or refresh the database schema for a machine
    Init {
        /// Machine name (derecho or casper)
        #[arg(short, long)]
        machine: String,
    },
    /// Fetch and store job records for a date range, one day at a time
    Sync {
        /// Machine name (derecho or casper)
        #[arg(short, long)]
        machine: String,
        /// First day to sync (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last day to sync, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Re-fetch days that are already summarized
        #[arg(long)]
        force: bool,
        /// Fetch and normalize but write nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild daily summary rows for a date range
    Summarize {
        /// Machine name (derecho or casper)
        #[arg(short, long)]
        machine: String,
        /// First day to summarize (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last day to summarize, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: String,
    },
    /// Usage totals, machine-wide or grouped by user/account/queue
    Usage {
        #[command(flatten)]
        report: ReportArgs,
        /// Group totals by user, account, or queue
        #[arg(long)]
        by: Option<String>,
        /// Resource family for grouped totals: cpu, gpu, or all
        #[arg(long, default_value = "all")]
        family: String,
    },
    /// Usage over time by day, month, or quarter
    History {
        #[command(flatten)]
        report: ReportArgs,
        /// Aggregation granularity: day, month, or quarter
        #[arg(long, default_value = "day")]
        group_by: String,
        /// Resource family: cpu, gpu, or all
        #[arg(long, default_value = "all")]
        family: String,
    },
    /// Job-size histogram over gpu, node, core, memory, or duration buckets
    Sizes {
        #[command(flatten)]
        report: ReportArgs,
        /// Bucket dimension: gpu, node, core, memory, or duration
        #[arg(long, default_value = "node")]
        by: String,
        /// Resource family: cpu, gpu, or all
        #[arg(long, default_value = "all")]
        family: String,
        /// Comma-separated ascending bucket boundaries
        #[arg(long)]
        bounds: Option<String>,
    },
    /// Queue-wait statistics over gpu, node, core, memory, or duration buckets
    Waits {
        #[command(flatten)]
        report: ReportArgs,
        /// Bucket dimension: gpu, node, core, memory, or duration
        #[arg(long, default_value = "node")]
        by: String,
        /// Comma-separated ascending bucket boundaries
        #[arg(long)]
        bounds: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { machine } => {
            let machine: Machine = machine.parse()?;
            let _store = JobStore::open(machine)?;
            println!(
                "{} schema ready at {}",
                machine.name(),
                db::db_path(machine).display()
            );
            Ok(())
        }
        Commands::Sync {
            machine,
            start,
            end,
            force,
            dry_run,
        } => run_sync(&machine, &start, &end, force, dry_run).await,
        Commands::Summarize {
            machine,
            start,
            end,
        } => {
            let machine: Machine = machine.parse()?;
            let start = parse_date_string(&start)?;
            let end = parse_date_string(&end)?;
            let mut store = JobStore::open(machine)?;
            let rows = summary::refresh_range(&mut store, start, end)?;
            println!("{rows} summary rows written for {}", machine.name());
            Ok(())
        }
        Commands::Usage { report, by, family } => {
            let (store, range) = open_report_store(&report)?;
            let family: ResourceFamily = family.parse()?;
            let (rows, columns) = match by {
                Some(dim) => {
                    let dim: Dimension = dim.parse()?;
                    let totals = queries::grouped_totals(&store, dim, family, &range)?;
                    let columns = vec![
                        ColumnSpec::new("key", dimension_header(dim), 16),
                        ColumnSpec::new("job_count", "Jobs", 8),
                        ColumnSpec::new("hours", "Hours", 14).with_precision(2),
                    ];
                    (to_rows(&totals)?, columns)
                }
                None => {
                    let totals = queries::summary_totals(&store, &range)?;
                    // The family narrows which hour columns the report shows
                    let mut columns = vec![ColumnSpec::new("job_count", "Jobs", 8)];
                    match family {
                        ResourceFamily::Cpu => {
                            columns.push(ColumnSpec::new("cpu_hours", "CPU-h", 14).with_precision(2))
                        }
                        ResourceFamily::Gpu => {
                            columns.push(ColumnSpec::new("gpu_hours", "GPU-h", 14).with_precision(2))
                        }
                        ResourceFamily::All => columns.extend([
                            ColumnSpec::new("charge_hours", "Charge", 14).with_precision(2),
                            ColumnSpec::new("cpu_hours", "CPU-h", 14).with_precision(2),
                            ColumnSpec::new("gpu_hours", "GPU-h", 14).with_precision(2),
                            ColumnSpec::new("memory_hours", "Mem-h", 14).with_precision(2),
                        ]),
                    }
                    (to_rows(std::slice::from_ref(&totals))?, columns)
                }
            };
            emit(&report, &rows, &columns)
        }
        Commands::History {
            report,
            group_by,
            family,
        } => {
            let (store, range) = open_report_store(&report)?;
            let granularity: Granularity = group_by.parse()?;
            let family: ResourceFamily = family.parse()?;
            let rows = queries::time_series(&store, granularity, family, &range)?;
            let columns = vec![
                ColumnSpec::new("period", "Period", 10),
                ColumnSpec::new("job_count", "Jobs", 8),
                ColumnSpec::new("user_count", "Users", 7),
                ColumnSpec::new("hours", "Hours", 14).with_precision(2),
            ];
            emit(&report, &to_rows(&rows)?, &columns)
        }
        Commands::Sizes {
            report,
            by,
            family,
            bounds,
        } => {
            let (store, range) = open_report_store(&report)?;
            let metric: BucketMetric = by.parse()?;
            let family: ResourceFamily = family.parse()?;
            let bounds = parse_bounds(bounds.as_deref(), metric)?;
            let rows = queries::bucketed(&store, metric, &bounds, family, &range)?;
            let columns = vec![
                ColumnSpec::new("label", "Bucket", 10),
                ColumnSpec::new("job_count", "Jobs", 8),
                ColumnSpec::new("user_count", "Users", 7),
                ColumnSpec::new("hours", "Hours", 14).with_precision(2),
            ];
            emit(&report, &to_rows(&rows)?, &columns)
        }
        Commands::Waits {
            report,
            by,
            bounds,
        } => {
            let (store, range) = open_report_store(&report)?;
            let metric: BucketMetric = by.parse()?;
            let bounds = parse_bounds(bounds.as_deref(), metric)?;
            let rows =
                queries::bucketed(&store, metric, &bounds, ResourceFamily::All, &range)?;
            let columns = vec![
                ColumnSpec::new("label", "Bucket", 10),
                ColumnSpec::new("job_count", "Jobs", 8),
                ColumnSpec::new("avg_wait_hours", "AvgWait-h", 10).with_precision(2),
            ];
            emit(&report, &to_rows(&rows)?, &columns)
        }
    }
}

async fn run_sync(machine: &str, start: &str, end: &str, force: bool, dry_run: bool) -> Result<()> {
    let machine: Machine = machine.parse()?;
    let start = parse_date_string(start)?;
    let end = parse_date_string(end)?;
    if end < start {
        anyhow::bail!("end date {end} precedes start date {start}");
    }

    let mut store = JobStore::open(machine)?;
    let source = SshSource::new(Duration::from_secs(get_config().sync.ssh_timeout_secs));
    let options = SyncOptions { force, dry_run };
    let report = sync_range(&mut store, &source, start, end, options).await?;

    for (day, outcome) in &report.days {
        match outcome {
            DayOutcome::Synced(stats) => println!(
                "{} {day}: {} inserted, {} duplicates, {} dropped, {} flagged",
                "ok".green(),
                stats.inserted,
                stats.skipped_duplicates,
                stats.dropped,
                stats.flagged
            ),
            DayOutcome::Skipped => {
                println!("{} {day}: already summarized", "skip".yellow())
            }
            DayOutcome::Failed(reason) => {
                println!("{} {day}: {reason}", "fail".red())
            }
        }
    }
    let totals = report.totals();
    println!(
        "{}: {} synced, {} skipped, {} failed ({} rows inserted)",
        machine.name().bold(),
        report.synced(),
        report.skipped(),
        report.failed(),
        totals.inserted
    );
    Ok(())
}

fn open_report_store(args: &ReportArgs) -> Result<(JobStore, DateRange)> {
    let machine: Machine = args.machine.parse()?;
    let start = parse_date_string(&args.start)?;
    let end = parse_date_string(&args.end)?;
    if end < start {
        anyhow::bail!("end date {end} precedes start date {start}");
    }
    Ok((JobStore::open(machine)?, DateRange::new(start, end)))
}

fn dimension_header(dim: Dimension) -> &'static str {
    match dim {
        Dimension::User => "User",
        Dimension::Account => "Account",
        Dimension::Queue => "Queue",
    }
}

fn parse_bounds(raw: Option<&str>, metric: BucketMetric) -> Result<Vec<i64>> {
    match raw {
        None => Ok(metric.default_bounds().to_vec()),
        Some(raw) => raw
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<i64>()
                    .with_context(|| format!("invalid bucket boundary: {p}"))
            })
            .collect(),
    }
}

fn to_rows<T: Serialize>(items: &[T]) -> Result<Vec<ReportRow>> {
    items
        .iter()
        .map(|item| match serde_json::to_value(item)? {
            serde_json::Value::Object(map) => Ok(map),
            other => anyhow::bail!("report row was not an object: {other}"),
        })
        .collect()
}

fn emit(args: &ReportArgs, rows: &[ReportRow], columns: &[ColumnSpec]) -> Result<()> {
    let format: ReportFormat = args.format.parse()?;
    let body = render(rows, columns, format)?;
    match &args.output {
        Some(path) => fs::write(path, &body)
            .with_context(|| format!("failed to write report to {}", path.display()))?,
        None => print!("{body}"),
    }
    Ok(())
}
