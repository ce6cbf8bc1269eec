//! Capabilities command - list what plans can call.

use anyhow::Result;
use clap::Args;

use super::{Context, print_json};

/// Arguments for the capabilities command.
#[derive(Args, Debug)]
pub struct CapabilitiesArgs {
    /// Only list capabilities in this category
    #[arg(long)]
    pub category: Option<String>,
}

/// Run the capabilities command.
pub async fn run(args: CapabilitiesArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let descriptors: Vec<_> = registry
        .descriptors()
        .into_iter()
        .filter(|d| args.category.as_deref().is_none_or(|c| d.category == c))
        .collect();

    if ctx.json_output {
        return print_json(&descriptors);
    }

    for descriptor in descriptors {
        println!(
            "{:<10} [{}] reliability {:.2}  {}",
            descriptor.name,
            descriptor.category,
            descriptor.reliability.weight(),
            descriptor.description
        );
        if ctx.verbose {
            for param in &descriptor.parameters {
                let marker = if param.required { "*" } else { " " };
                println!("    {marker}{}: {}", param.name, param.param_type.as_str());
            }
        }
    }
    Ok(())
}
