//! `tradeflow` command line
//!
//! Every invocation loads the state file, applies one command and writes
//! the state back if anything changed.

pub mod flow;
pub mod order;
pub mod output;
mod run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::AppConfig;
use crate::persistence::{self, StateFile};
use crate::runtime::{OrchestratorContext, RuntimeEngine};

pub use flow::FlowCommands;
pub use order::OrderCommands;
use output::OutputMode;

#[derive(Parser, Debug)]
#[command(name = "tradeflow")]
#[command(author, version, about = "Trading workflow orchestrator", long_about = None)]
pub struct Cli {
    /// Configuration directory
    #[arg(short, long, global = true, default_value = "config")]
    pub config: PathBuf,

    /// State file (defaults to state_file from config, then ~/.tradeflow/state.json)
    #[arg(long, global = true, env = "TRADEFLOW_STATE_FILE")]
    pub state: Option<PathBuf>,

    /// Output as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and manage orders
    #[command(subcommand)]
    Order(OrderCommands),
    /// Work with flows and templates
    #[command(subcommand)]
    Flow(FlowCommands),
    /// Run active orders with the paper plugin until Ctrl+C
    Run,
}

impl Commands {
    /// Long-running commands get full logging; one-shot commands stay quiet
    pub fn is_long_running(&self) -> bool {
        matches!(self, Commands::Run)
    }
}

pub async fn execute(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    let state_path = cli.state.clone().unwrap_or_else(|| config.state_path());
    let mode = OutputMode::from_json_flag(cli.json);

    let ctx = Arc::new(OrchestratorContext::new(config));
    ctx.register_builtin_plugins();
    let (flows, orders) = persistence::load(&state_path).await?.restore(&ctx);
    debug!(flows, orders, path = %state_path.display(), "Loaded state");

    let runtime = RuntimeEngine::new(ctx.clone());
    let dirty = match cli.command {
        Commands::Order(cmd) => order::run(cmd, &runtime, mode)?,
        Commands::Flow(cmd) => flow::run(cmd, &runtime, mode).await?,
        Commands::Run => {
            run::run(&runtime, &state_path).await?;
            false
        }
    };

    if dirty {
        persistence::save(&state_path, &StateFile::capture(&ctx)).await?;
    }
    Ok(())
}
