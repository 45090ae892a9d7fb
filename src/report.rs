//! Report rendering.
//!
//! A report is a sequence of uniform rows plus an ordered column
//! specification; rendering is a pure transformation into one of four
//! textual formats. The formatter never touches the filesystem, the CLI
//! decides where the string goes.

use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

/// One report row: ordered key/value map, keys matching [`ColumnSpec::key`].
pub type ReportRow = Map<String, Value>;

/// Presentation of one output column.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub key: &'static str,
    pub header: &'static str,
    /// Minimum width in the fixed-width format.
    pub width: usize,
    /// Decimal places for numeric cells; `None` renders numbers as-is.
    pub precision: Option<usize>,
}

impl ColumnSpec {
    pub fn new(key: &'static str, header: &'static str, width: usize) -> Self {
        Self {
            key,
            header,
            width,
            precision: None,
        }
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = Some(precision);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Fixed-width aligned text.
    #[default]
    Dat,
    Json,
    Csv,
    Markdown,
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dat" | "txt" => Ok(ReportFormat::Dat),
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "md" | "markdown" => Ok(ReportFormat::Markdown),
            other => bail!("unknown report format: {other} (expected dat, json, csv, or md)"),
        }
    }
}

/// Render rows under a column specification. Deterministic: identical
/// input always produces identical output. An empty row set still yields
/// a valid header-only document.
pub fn render(rows: &[ReportRow], columns: &[ColumnSpec], format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Dat => Ok(render_dat(rows, columns)),
        ReportFormat::Json => render_json(rows, columns),
        ReportFormat::Csv => render_csv(rows, columns),
        ReportFormat::Markdown => Ok(render_markdown(rows, columns)),
    }
}

fn cell(row: &ReportRow, spec: &ColumnSpec) -> String {
    match row.get(spec.key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::Number(n)) => match spec.precision {
            Some(p) if n.is_f64() || p > 0 => {
                format!("{:.p$}", n.as_f64().unwrap_or_default(), p = p)
            }
            _ => n.to_string(),
        },
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn render_dat(rows: &[ReportRow], columns: &[ColumnSpec]) -> String {
    let mut out = String::new();
    for (i, spec) in columns.iter().enumerate() {
        if i + 1 == columns.len() {
            out.push_str(spec.header);
        } else {
            let _ = write!(out, "{:width$} ", spec.header, width = spec.width);
        }
    }
    out.push('\n');
    for row in rows {
        for (i, spec) in columns.iter().enumerate() {
            let text = cell(row, spec);
            if i + 1 == columns.len() {
                out.push_str(&text);
            } else {
                let _ = write!(out, "{:width$} ", text, width = spec.width);
            }
        }
        out.push('\n');
    }
    out
}

fn render_json(rows: &[ReportRow], columns: &[ColumnSpec]) -> Result<String> {
    // project onto the column spec so every format exposes the same shape
    let projected: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut obj = Map::new();
            for spec in columns {
                obj.insert(
                    spec.key.to_string(),
                    row.get(spec.key).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(obj)
        })
        .collect();
    serde_json::to_string_pretty(&projected).context("failed to serialize report")
}

fn render_csv(rows: &[ReportRow], columns: &[ColumnSpec]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns.iter().map(|c| c.header))
        .context("failed to write csv header")?;
    for row in rows {
        writer
            .write_record(columns.iter().map(|spec| cell(row, spec)))
            .context("failed to write csv row")?;
    }
    let bytes = writer.into_inner().context("failed to flush csv buffer")?;
    String::from_utf8(bytes).context("csv output was not utf-8")
}

fn render_markdown(rows: &[ReportRow], columns: &[ColumnSpec]) -> String {
    let mut out = String::new();
    out.push('|');
    for spec in columns {
        let _ = write!(out, " {} |", spec.header);
    }
    out.push('\n');
    out.push('|');
    for _ in columns {
        out.push_str(" --- |");
    }
    out.push('\n');
    for row in rows {
        out.push('|');
        for spec in columns {
            let _ = write!(out, " {} |", cell(row, spec));
        }
        out.push('\n');
    }
    out
}
