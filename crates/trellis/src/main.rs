//! Trellis command-line interface.
//!
//! Validates, orders and runs plan files against the built-in demo
//! capabilities.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod commands;

use commands::{capabilities, order, run, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Trellis - capability orchestration over dependency graphs
#[derive(Parser)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Config file, layered over the user and project configs
    #[arg(short, long, global = true, env = "TRELLIS_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a plan file against the registered capabilities
    Validate(validate::ValidateArgs),

    /// Show the level-by-level execution order of a plan
    Order(order::OrderArgs),

    /// Execute a plan
    Run(run::RunArgs),

    /// List registered capabilities
    Capabilities(capabilities::CapabilitiesArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = trellis_config::load_config(None, cli.config.as_deref())?;
    let logging = loaded.config.logging();

    let level = if cli.verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "trellis={level},trellis_engine={level},trellis_plan={level},trellis_registry={level},trellis_state={level},trellis_config={level},warn"
        ))
    });

    // Logs go to stderr so stdout stays clean for results.
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    let json_logs = cli.log_json || logging.json;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            json_logs.then(|| {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer.clone())
            }),
        )
        .with(
            (!json_logs).then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(writer)
            }),
        )
        .init();

    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }

    let ctx = commands::Context {
        config: loaded.config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Order(args) => order::run(args, &ctx).await,
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Capabilities(args) => capabilities::run(args, &ctx).await,
    }
}
