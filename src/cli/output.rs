//! Output formatting: human-readable tables (default) or JSON (`--json`).

use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print rows as a table, or the full records as JSON
pub fn print_rows<T: Tabled, S: Serialize>(rows: &[T], records: &[S], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if rows.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(records)?),
    }
    Ok(())
}

/// Single records are always pretty JSON
pub fn print_item<T: Serialize>(item: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

pub fn print_success(msg: &str, mode: OutputMode) {
    if mode == OutputMode::Table {
        println!("\x1b[32m{msg}\x1b[0m");
    }
}

pub fn print_warn(msg: &str) {
    eprintln!("\x1b[33m{msg}\x1b[0m");
}
