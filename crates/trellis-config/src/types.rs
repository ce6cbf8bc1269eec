//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [engine]
//! max_parallel_steps = 3
//! default_step_timeout_secs = 30.0
//! condition_policy = "fail_closed"
//!
//! [registry]
//! duplicate_policy = "reject"
//!
//! [state]
//! persistence_dir = "/var/lib/trellis/state"
//! sweep_interval_secs = 60
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., a project-local
/// override that only sets `[engine]`) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    /// Execution engine settings.
    pub engine: Option<EngineSection>,

    /// Capability registry settings.
    pub registry: Option<RegistrySection>,

    /// State store settings.
    pub state: Option<StateSection>,

    /// Logging settings.
    pub logging: Option<LoggingSection>,
}

impl TrellisConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: TrellisConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.registry.is_some() {
            self.registry = other.registry;
        }
        if other.state.is_some() {
            self.state = other.state;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref engine) = self.engine {
            if engine.max_parallel_steps == 0 {
                return Err(ConfigError::Invalid {
                    field: "engine.max_parallel_steps".into(),
                    reason: "must be at least 1".into(),
                });
            }
            if let Some(secs) = engine.default_step_timeout_secs
                && (secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err())
            {
                return Err(ConfigError::Invalid {
                    field: "engine.default_step_timeout_secs".into(),
                    reason: format!("must be a positive number of seconds, got {secs}"),
                });
            }
        }
        if let Some(ref state) = self.state
            && state.sweep_interval_secs == Some(0)
        {
            return Err(ConfigError::Invalid {
                field: "state.sweep_interval_secs".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Effective engine section (defaults when absent).
    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    /// Effective registry section (defaults when absent).
    pub fn registry(&self) -> RegistrySection {
        self.registry.clone().unwrap_or_default()
    }

    /// Effective state section (defaults when absent).
    pub fn state(&self) -> StateSection {
        self.state.clone().unwrap_or_default()
    }

    /// Effective logging section (defaults when absent).
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Default bound on concurrently running steps within one run.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 3;

/// What to do with a CUSTOM condition that cannot be parsed at run time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionPolicy {
    /// Treat the condition as unsatisfiable; the step ends up SKIPPED.
    #[default]
    FailClosed,
    /// Treat the condition as satisfied and run the step anyway.
    FailOpen,
}

/// Execution engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Maximum steps running at once within a single run.
    pub max_parallel_steps: usize,
    /// Timeout applied to steps that do not declare their own.
    pub default_step_timeout_secs: Option<f64>,
    /// Save each run's context into the store's run scope when it ends.
    pub persist_run_context: bool,
    /// Handling of unparseable CUSTOM conditions.
    pub condition_policy: ConditionPolicy,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            default_step_timeout_secs: None,
            persist_run_context: false,
            condition_policy: ConditionPolicy::default(),
        }
    }
}

impl EngineSection {
    /// Default step timeout as a `Duration`. Values a `Duration` cannot
    /// hold mean no timeout.
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Behavior when a capability name is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Refuse the second registration with an error.
    #[default]
    Reject,
    /// Replace the existing capability and log a warning.
    Overwrite,
}

/// Capability registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Duplicate registration handling.
    pub duplicate_policy: DuplicatePolicy,
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// State store configuration.
///
/// ```toml
/// [state]
/// persistence_dir = "./state"
/// sweep_interval_secs = 60
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Directory for global/session scope files. In-memory only when unset.
    pub persistence_dir: Option<PathBuf>,
    /// Interval for the background expiry sweep. Disabled when unset.
    pub sweep_interval_secs: Option<u64>,
}

impl StateSection {
    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level for trellis crates (`error`..`trace`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
