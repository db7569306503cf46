//! `tradeflow flow`: templates, validation, import/export and one-off runs.

use anyhow::Context;
use clap::Subcommand;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tabled::Tabled;

use super::output::{self, OutputMode};
use crate::flow::{self, Flow, FlowDraft};
use crate::runtime::RuntimeEngine;

#[derive(Subcommand, Debug, Clone)]
pub enum FlowCommands {
    /// List the built-in templates
    Templates,
    /// Create a flow from a built-in template
    New { template: String },
    /// List stored flows
    List,
    /// Validate a flow document without storing it
    Validate { file: PathBuf },
    /// Write a stored flow as JSON (stdout unless --output)
    Export {
        id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a flow document under a fresh id
    Import { file: PathBuf },
    /// Execute a stored flow once with the paper plugin
    Exec {
        id: String,
        /// JSON object merged into the execution snapshot
        #[arg(long)]
        input: Option<String>,
    },
}

#[derive(Debug, Serialize, Tabled)]
pub struct TemplateRow {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Tabled)]
pub struct FlowRow {
    pub id: String,
    pub name: String,
    pub nodes: usize,
    pub version: u32,
    pub updated: String,
}

impl From<&Flow> for FlowRow {
    fn from(flow: &Flow) -> Self {
        Self {
            id: flow.id.clone(),
            name: flow.name.clone(),
            nodes: flow.nodes.len(),
            version: flow.version,
            updated: flow.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

fn read_document(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Returns whether any state changed
pub async fn run(cmd: FlowCommands, runtime: &RuntimeEngine, mode: OutputMode) -> anyhow::Result<bool> {
    let ctx = runtime.context();
    match cmd {
        FlowCommands::Templates => {
            let rows: Vec<TemplateRow> = flow::templates()
                .iter()
                .map(|t| TemplateRow {
                    id: t.id.to_string(),
                    name: t.name.to_string(),
                    description: t.description.to_string(),
                })
                .collect();
            output::print_rows(&rows, &rows, mode)?;
            Ok(false)
        }
        FlowCommands::New { template } => {
            let created = ctx.flows.create_from_template(&template)?;
            output::print_success(&format!("Created flow {} from '{}'", created.id, template), mode);
            output::print_item(&created)?;
            Ok(true)
        }
        FlowCommands::List => {
            let mut flows = ctx.flows.list();
            flows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let rows: Vec<FlowRow> = flows.iter().map(FlowRow::from).collect();
            output::print_rows(&rows, &flows, mode)?;
            Ok(false)
        }
        FlowCommands::Validate { file } => {
            let draft: FlowDraft = serde_json::from_str(&read_document(&file)?)
                .with_context(|| format!("{} is not a flow document", file.display()))?;
            let report = flow::validate(&draft.build());
            match mode {
                OutputMode::Json => output::print_item(&report)?,
                OutputMode::Table if report.valid => output::print_success("Flow is valid", mode),
                OutputMode::Table => {
                    for error in &report.errors {
                        output::print_warn(&format!("- {}", error));
                    }
                }
            }
            report.into_result()?;
            Ok(false)
        }
        FlowCommands::Export { id, output: target } => {
            let json = ctx.flows.export(&id)?;
            match target {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    output::print_success(&format!("Exported flow {} to {}", id, path.display()), mode);
                }
                None => println!("{}", json),
            }
            Ok(false)
        }
        FlowCommands::Import { file } => {
            let imported = ctx.flows.import(&read_document(&file)?)?;
            let report = flow::validate(&imported);
            if !report.valid {
                output::print_warn(&format!(
                    "Imported flow {} does not validate: {}",
                    imported.id,
                    report.errors.join("; ")
                ));
            }
            output::print_success(&format!("Imported flow {}", imported.id), mode);
            if mode == OutputMode::Json {
                output::print_item(&imported)?;
            }
            Ok(true)
        }
        FlowCommands::Exec { id, input } => {
            let input: Option<Value> = input
                .map(|raw| serde_json::from_str(&raw).context("--input must be JSON"))
                .transpose()?;
            ctx.plugins.bind_all(&ctx.plugin_context())?;
            let result = runtime.execute_flow(&id, input).await?;
            output::print_item(&result)?;
            runtime.tasks().wait_all().await;
            Ok(false)
        }
    }
}
