//! CLI command handlers.

pub mod capabilities;
pub mod order;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context as _, Result};

use trellis::demo::register_demo_capabilities;
use trellis::plan::{Plan, PlanFile};
use trellis::registry::CapabilityRegistry;
use trellis_config::TrellisConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: TrellisConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Registry with the configured duplicate policy and the demo
    /// capabilities.
    pub fn registry(&self) -> Result<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::from_config(&self.config.registry());
        register_demo_capabilities(&mut registry)?;
        Ok(registry)
    }
}

/// Load a plan from a `.toml` or `.json` file.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let file = PlanFile::from_file(path)
        .with_context(|| format!("failed to load plan {}", path.display()))?;
    Ok(file.into_plan())
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
