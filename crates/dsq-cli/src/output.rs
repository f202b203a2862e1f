//! Output formatting for dsq (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use dsq_core::{DataFrame, Field};
use serde::Serialize;
use serde_json::Value;
use tabled::builder::Builder;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => print_csv(data),
        }
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Csv => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
                println!("{}", keys.join(","));
                let values: Vec<String> = pairs.iter().map(|(_, v)| escape_csv(v)).collect();
                println!("{}", values.join(","));
            }
        }
    }

    /// Print one data frame, one row per sample
    pub fn print_frame(&self, frame: &DataFrame) {
        match self.format {
            OutputFormat::Table => {
                if !self.quiet {
                    println!("{}", frame_title(frame).bold());
                }
                if frame.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                    return;
                }
                let mut builder = Builder::default();
                builder.push_record(frame.fields.iter().map(field_header));
                for row in frame_rows(frame) {
                    builder.push_record(row);
                }
                println!("{}", builder.build());
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Csv => {
                let headers: Vec<String> = frame
                    .fields
                    .iter()
                    .map(|f| escape_csv(&field_header(f)))
                    .collect();
                println!("{}", headers.join(","));
                for row in frame_rows(frame) {
                    let row: Vec<String> = row.iter().map(|v| escape_csv(v)).collect();
                    println!("{}", row.join(","));
                }
            }
        }
    }
}

fn frame_title(frame: &DataFrame) -> String {
    match (&frame.ref_id, &frame.name) {
        (Some(ref_id), Some(name)) => format!("[{}] {}", ref_id, name),
        (Some(ref_id), None) => format!("[{}]", ref_id),
        (None, Some(name)) => name.clone(),
        (None, None) => "(unnamed frame)".to_string(),
    }
}

/// Column header: field name followed by its labels
fn field_header(field: &Field) -> String {
    match &field.labels {
        Some(labels) if !labels.is_empty() => {
            let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("{} {{{}}}", field.name, labels.join(", "))
        }
        _ => field.name.clone(),
    }
}

/// Row-major view of a frame's columns; short columns are padded with blanks
pub fn frame_rows(frame: &DataFrame) -> Vec<Vec<String>> {
    (0..frame.len())
        .map(|i| {
            frame
                .fields
                .iter()
                .map(|f| f.values.get(i).map(format_json_value).unwrap_or_default())
                .collect()
        })
        .collect()
}

/// Format a JSON value for display
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Print data as CSV
fn print_csv<T: Serialize>(data: &[T]) {
    let Some(first) = data.first() else {
        return;
    };

    if let Ok(Value::Object(map)) = serde_json::to_value(first) {
        let headers: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
        println!("{}", headers.join(","));

        for item in data {
            if let Ok(Value::Object(row)) = serde_json::to_value(item) {
                let values: Vec<String> = headers
                    .iter()
                    .map(|h| {
                        row.get(*h)
                            .map(|v| escape_csv(&format_json_value(v)))
                            .unwrap_or_default()
                    })
                    .collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Escape a value for CSV output
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Datasource display for datasources command
#[derive(Debug, Tabled, Serialize)]
pub struct DataSourceRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "UID")]
    pub uid: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Type")]
    pub type_name: String,
    #[tabled(rename = "Default")]
    pub is_default: String,
}
