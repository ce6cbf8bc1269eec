//! Validate command - check a plan without running it.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;

use trellis::plan::validate_plan;

use super::{Context, load_plan, print_json};

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Plan file (.toml or .json)
    pub plan: PathBuf,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let registry = ctx.registry()?;
    let report = validate_plan(&plan, &registry);

    if ctx.json_output {
        print_json(&report)?;
    } else {
        println!("Plan '{}': {}", plan.id, report);
        for error in &report.errors {
            println!("  error:   {error}");
        }
        for warning in &report.warnings {
            println!("  warning: {warning}");
        }
    }

    if !report.is_valid() {
        bail!("plan '{}' is invalid", plan.id);
    }
    Ok(())
}
