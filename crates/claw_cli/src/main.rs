//! clawd - reflex engine daemon
//!
//! `clawd run` hosts the reflex engine for a set of owners. The other
//! subcommands inspect and adjust the same SQLite database offline.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod logging;

use claw_core::ClawConfig;

#[derive(Parser, Debug)]
#[command(name = "clawd", author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "clawd.toml", env = "CLAW_CONFIG")]
    config: PathBuf,

    /// Database path (overrides the config file)
    #[arg(long)]
    db: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine: event bus, tick loop, layer-1 batching, retention
    Run {
        /// Owner to serve; repeat for several
        #[arg(short, long = "owner", required = true)]
        owners: Vec<String>,
    },
    /// Inspect and manage reflexes
    Reflexes {
        #[command(subcommand)]
        action: commands::ReflexCommands,
    },
    /// Query the execution audit trail
    Executions {
        #[command(subcommand)]
        action: commands::ExecutionCommands,
    },
    /// Delete execution records older than the retention window
    Prune {
        /// Overrides `retention.max_age_days`
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_tracing(cli.verbose, cli.json, cli.log_dir.as_deref())?;

    let mut config = ClawConfig::load_or_default(&cli.config);
    if let Some(db) = cli.db {
        config.runtime.db_path = db;
    }

    match cli.command {
        Commands::Run { owners } => commands::run(config, owners).await,
        Commands::Reflexes { action } => commands::handle_reflexes(&config, action).await,
        Commands::Executions { action } => commands::handle_executions(&config, action).await,
        Commands::Prune { days } => commands::prune(&config, days).await,
    }
}
