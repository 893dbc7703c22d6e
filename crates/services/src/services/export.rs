//! Printable document export: tabular reports and single-record summaries.
//!
//! Pure transforms from a descriptor to a print-ready HTML document. The
//! only environment interaction is handing the document to a
//! [`PrintSurface`]; a denied surface (pop-up blocker) is an expected
//! condition reported in the outcome, not an error.

use std::sync::Arc;

use chrono::Local;
use client::Row;
use serde_json::Value;
use tracing::warn;

/// Per-column cell formatter. Receives the raw value (or `Null` when the
/// key is absent) and produces the rendered text.
pub type Formatter = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// One column of a tabular export: header text, row key, optional
/// formatter.
#[derive(Clone)]
pub struct Column {
    pub header: String,
    pub key: String,
    pub formatter: Option<Formatter>,
}

impl Column {
    pub fn new(header: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            key: key.into(),
            formatter: None,
        }
    }

    pub fn with_formatter(
        mut self,
        formatter: impl Fn(&Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }
}

/// Synchronous result of an export operation. The print/download side
/// effect itself is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub success: bool,
    pub message: String,
}

pub const POPUP_BLOCKED_MESSAGE: &str = "Please allow pop-ups to export PDF";

/// A rendering surface that can open a new output context and queue a
/// print action. Returns `false` when the environment denies it.
pub trait PrintSurface {
    fn open_document(&self, title: &str, html: &str) -> bool;
}

/// Descriptor for a printable tabular report.
pub struct TableExport {
    pub title: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub filename: String,
    pub company_name: String,
    pub show_generated_at: bool,
}

pub struct RecordField {
    pub label: String,
    pub value: String,
    pub highlight: bool,
}

/// Descriptor for a printable single-record summary.
pub struct RecordExport {
    pub title: String,
    pub record_id: String,
    pub fields: Vec<RecordField>,
}

/// Resolve one cell: formatter output when the column has one, otherwise
/// the scalar text, with `-` standing in for null/missing/empty values.
pub fn resolve_cell(row: &Row, column: &Column) -> String {
    let raw = row.get(&column.key).unwrap_or(&Value::Null);
    match &column.formatter {
        Some(format) => format(raw),
        None => display_value(raw),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "-".into(),
        Value::String(s) if s.is_empty() => "-".into(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

const DOCUMENT_STYLE: &str = "\
body { font-family: sans-serif; margin: 2rem; color: #222; }\n\
header { border-bottom: 2px solid #222; margin-bottom: 1rem; }\n\
table { width: 100%; border-collapse: collapse; }\n\
th, td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; }\n\
.status { padding: 2px 6px; border-radius: 4px; background: #eee; }\n\
.callout { border: 2px solid #222; padding: 8px; margin: 8px 0; font-weight: bold; }\n\
.field { display: flex; justify-content: space-between; padding: 4px 0; }";

// Print is queued from inside the document so the surface can finish
// laying out content first.
const PRINT_SCRIPT: &str = "setTimeout(function () { window.print(); }, 250);";

fn document_shell(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{}</title>\
         <style>{DOCUMENT_STYLE}</style></head><body>{body}\
         <script>{PRINT_SCRIPT}</script></body></html>",
        escape(title)
    )
}

/// Render the full print document for a tabular export. The "generated on"
/// stamp is presentation text only; it never changes the table structure.
pub fn table_document(export: &TableExport) -> String {
    let mut body = format!(
        "<header><h1>{}</h1><p class=\"company\">{}</p>",
        escape(&export.title),
        escape(&export.company_name)
    );
    if export.show_generated_at {
        let stamp = Local::now().format("%Y-%m-%d %H:%M");
        body.push_str(&format!("<p class=\"generated\">Generated on {stamp}</p>"));
    }
    body.push_str(&format!(
        "<p class=\"count\">{} records</p></header>",
        export.rows.len()
    ));

    body.push_str("<table><thead><tr>");
    for column in &export.columns {
        body.push_str(&format!("<th>{}</th>", escape(&column.header)));
    }
    body.push_str("</tr></thead><tbody>");
    for row in &export.rows {
        body.push_str("<tr>");
        for column in &export.columns {
            let text = escape(&resolve_cell(row, column));
            if column.key == "status" {
                // Presentational status tag straight off the literal
                // value; no validation against a known set.
                body.push_str(&format!(
                    "<td><span class=\"status status-{}\">{text}</span></td>",
                    text.to_lowercase()
                ));
            } else {
                body.push_str(&format!("<td>{text}</td>"));
            }
        }
        body.push_str("</tr>");
    }
    body.push_str("</tbody></table>");

    document_shell(&export.title, &body)
}

/// Render the print document for a single-record summary. Highlighted
/// fields become emphasised call-out blocks.
pub fn record_document(export: &RecordExport) -> String {
    let mut body = format!(
        "<header><h1>{}</h1><p class=\"record-id\">{}</p></header>",
        escape(&export.title),
        escape(&export.record_id)
    );
    for field in &export.fields {
        let class = if field.highlight { "callout" } else { "field" };
        body.push_str(&format!(
            "<div class=\"{class}\"><span class=\"label\">{}</span>\
             <span class=\"value\">{}</span></div>",
            escape(&field.label),
            escape(&field.value)
        ));
    }
    document_shell(&export.title, &body)
}

/// Export a tabular report to the print surface.
pub fn print_table(export: &TableExport, surface: &dyn PrintSurface) -> ExportOutcome {
    let document = table_document(export);
    if !surface.open_document(&export.title, &document) {
        warn!(title = %export.title, "print surface denied");
        return ExportOutcome {
            success: false,
            message: POPUP_BLOCKED_MESSAGE.into(),
        };
    }
    ExportOutcome {
        success: true,
        message: format!("Exported {} records to print view", export.rows.len()),
    }
}

/// Export a single-record summary to the print surface.
pub fn print_record(export: &RecordExport, surface: &dyn PrintSurface) -> ExportOutcome {
    let document = record_document(export);
    if !surface.open_document(&export.title, &document) {
        warn!(title = %export.title, "print surface denied");
        return ExportOutcome {
            success: false,
            message: POPUP_BLOCKED_MESSAGE.into(),
        };
    }
    ExportOutcome {
        success: true,
        message: format!("Opened print view for {}", export.title),
    }
}
