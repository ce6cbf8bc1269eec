//! Order command - show execution levels.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{Context, load_plan, print_json};

/// Arguments for the order command.
#[derive(Args, Debug)]
pub struct OrderArgs {
    /// Plan file (.toml or .json)
    pub plan: PathBuf,
}

/// Run the order command.
pub async fn run(args: OrderArgs, ctx: &Context) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let levels = plan.execution_levels()?;

    if ctx.json_output {
        return print_json(&json!({ "plan": plan.id, "levels": levels }));
    }

    println!("Execution order for '{}':", plan.id);
    for (i, level) in levels.iter().enumerate() {
        println!("  {}: {}", i + 1, level.join(", "));
    }
    let fallbacks = plan.fallback_ids();
    if !fallbacks.is_empty() {
        let mut fallbacks: Vec<&str> = fallbacks.into_iter().collect();
        fallbacks.sort_unstable();
        println!("  fallback only: {}", fallbacks.join(", "));
    }
    Ok(())
}
