//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use lumen_common::{RunStatus, TestStatus};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn print_plain<T: TableDisplay>(item: &T) {
    for (header, value) in T::headers().iter().zip(item.row()) {
        println!("{}: {}", header, value);
    }
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = table();
            table.set_header(T::headers());
            table.add_row(item.row());
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(item).unwrap_or_default());
        }
        OutputFormat::Plain => print_plain(item),
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
            return;
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(items).unwrap_or_default());
            return;
        }
        _ => {}
    }

    if items.is_empty() {
        println!("No items found.");
        return;
    }

    if let OutputFormat::Plain = format {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                println!("---");
            }
            print_plain(item);
        }
        return;
    }

    let mut table = table();
    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    println!("{table}");
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "i".blue(), message);
}

/// Epoch seconds as UTC text
pub fn format_time(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

pub fn format_opt_time(ts: Option<i64>) -> String {
    ts.map(format_time).unwrap_or_else(|| "-".to_string())
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn colored_run_status(status: RunStatus) -> String {
    let text = status.as_str();
    match status {
        RunStatus::TestCompleted | RunStatus::Completed => text.green().to_string(),
        RunStatus::TestFailed => text.yellow().to_string(),
        RunStatus::Failed => text.red().to_string(),
        RunStatus::InProgress => text.cyan().to_string(),
        RunStatus::Opened | RunStatus::Closed => text.dimmed().to_string(),
    }
}

pub fn colored_test_status(status: TestStatus) -> String {
    let text = status.as_str();
    match status {
        TestStatus::Pass => text.green().to_string(),
        TestStatus::Fail | TestStatus::Error => text.red().to_string(),
        TestStatus::Manual | TestStatus::Incomplete => text.yellow().to_string(),
        TestStatus::NotApplicable | TestStatus::InProgress => text.dimmed().to_string(),
    }
}
