//! Error types for the orchestrator facade.

use thiserror::Error;

use trellis_engine::EngineError;
use trellis_plan::PlanIssue;
use trellis_state::StateError;

/// Result type alias using OrchestratorError.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by [`crate::Orchestrator`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The plan cannot be executed at all (cycle, dangling id, duplicate).
    #[error("Invalid plan: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    InvalidPlan(Vec<PlanIssue>),

    /// Store construction failed (e.g. unreadable persistence files).
    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidPlan(issues) => OrchestratorError::InvalidPlan(issues),
        }
    }
}
