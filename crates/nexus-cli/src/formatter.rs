//! Output formatting for command results.
//!
//! Supports table, JSON, CSV, and raw output formats.

use comfy_table::{Cell, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Formatted table output.
    Table,
    /// JSON output.
    Json,
    /// CSV output.
    Csv,
    /// Raw output (values separated by tabs).
    Raw,
}

impl OutputFormat {
    /// Parses a format name as written in the config file.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "table" => Some(Self::Table),
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Tabular command output.
///
/// Rows are built from any `Serialize` value: each top-level field becomes a
/// column, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl Report {
    /// Builds a report with one row per item.
    pub fn from_items<T: Serialize>(items: &[T]) -> serde_json::Result<Self> {
        let mut report = Self::default();
        for item in items {
            report.push(item)?;
        }
        Ok(report)
    }

    /// Builds a two-column `field | value` report from one item.
    pub fn from_fields<T: Serialize>(item: &T) -> serde_json::Result<Self> {
        let mut report = Self {
            columns: vec!["field".into(), "value".into()],
            rows: Vec::new(),
        };
        if let JsonValue::Object(map) = serde_json::to_value(item)? {
            for (name, value) in map {
                report.rows.push(vec![JsonValue::String(name), value]);
            }
        }
        Ok(report)
    }

    /// Appends one row; the first row fixes the columns.
    pub fn push<T: Serialize>(&mut self, item: &T) -> serde_json::Result<()> {
        match serde_json::to_value(item)? {
            JsonValue::Object(map) => {
                if self.columns.is_empty() {
                    self.columns = map.keys().cloned().collect();
                }
                let row = self
                    .columns
                    .iter()
                    .map(|c| map.get(c).cloned().unwrap_or(JsonValue::Null))
                    .collect();
                self.rows.push(row);
            }
            other => {
                if self.columns.is_empty() {
                    self.columns = vec!["value".into()];
                }
                self.rows.push(vec![other]);
            }
        }
        Ok(())
    }
}

/// Formats a report according to the specified format.
pub fn format_report(report: &Report, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_table(report),
        OutputFormat::Json => format_json(report),
        OutputFormat::Csv => format_csv(report),
        OutputFormat::Raw => format_raw(report),
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Formats the report as a table.
fn format_table(report: &Report) -> String {
    let mut table = Table::new();

    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);

    if !report.columns.is_empty() {
        table.set_header(report.columns.iter().map(Cell::new));
    }
    for row in &report.rows {
        table.add_row(row.iter().map(|v| Cell::new(cell_text(v))));
    }

    table.to_string()
}

/// Formats the report as a JSON array of objects.
fn format_json(report: &Report) -> String {
    let rows: Vec<JsonValue> = report
        .rows
        .iter()
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for (i, value) in row.iter().enumerate() {
                let col_name = report
                    .columns
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column_{i}"));
                obj.insert(col_name, value.clone());
            }
            JsonValue::Object(obj)
        })
        .collect();

    serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
}

/// Formats the report as CSV.
fn format_csv(report: &Report) -> String {
    let mut output = String::new();

    if !report.columns.is_empty() {
        let header: Vec<String> = report.columns.iter().map(|c| escape_csv(c)).collect();
        output.push_str(&header.join(","));
        output.push('\n');
    }
    for row in &report.rows {
        let values: Vec<String> = row.iter().map(|v| escape_csv(&cell_text(v))).collect();
        output.push_str(&values.join(","));
        output.push('\n');
    }

    output
}

/// Escapes a value for CSV output.
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Formats the report as raw tab-separated values, without a header.
fn format_raw(report: &Report) -> String {
    let mut output = String::new();
    for row in &report.rows {
        let values: Vec<String> = row.iter().map(cell_text).collect();
        output.push_str(&values.join("\t"));
        output.push('\n');
    }
    output
}
