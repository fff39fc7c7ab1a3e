pub mod csv_out;
pub mod json;
pub mod minimal;
pub mod table;

use clap::ValueEnum;
use serde_json::Value;

/// How results are written to stdout.
#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Full envelope as JSON
    Json,
    /// Field/value tables, one per nested section
    Table,
    /// Field/value rows, or one row per sampled portfolio
    Csv,
    /// Just the headline number (the Sharpe ratio where there is one)
    Minimal,
}

pub fn format_output(format: &OutputFormat, value: &Value) {
    match format {
        OutputFormat::Json => json::print_json(value),
        OutputFormat::Table => table::print_table(value),
        OutputFormat::Csv => csv_out::print_csv(value),
        OutputFormat::Minimal => minimal::print_minimal(value),
    }
}
