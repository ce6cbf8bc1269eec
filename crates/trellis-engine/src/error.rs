//! Error types for the execution engine.

use std::time::Duration;

use thiserror::Error;
use trellis_plan::PlanIssue;
use trellis_registry::CapabilityError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that abort a run before any step executes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan has structural problems (cycle, dangling id, duplicate id).
    #[error("Invalid plan: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    InvalidPlan(Vec<PlanIssue>),
}

/// Why a single step attempt failed.
///
/// These never abort a run; they become the error message of a FAILED
/// result.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("capability '{0}' not found")]
    CapabilityNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("unresolved reference '{reference}': {reason}")]
    UnresolvedReference { reference: String, reason: String },

    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("capability panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the attempt stopped because the run was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            StepError::Cancelled | StepError::Capability(CapabilityError::Cancelled)
        )
    }

    /// Short machine-readable tag, stored in result metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::CapabilityNotFound(_) => "capability_not_found",
            StepError::InvalidParameters(_) => "invalid_parameters",
            StepError::UnresolvedReference { .. } => "unresolved_reference",
            StepError::Timeout(_) => "timeout",
            StepError::Capability(CapabilityError::Cancelled) | StepError::Cancelled => {
                "cancelled"
            }
            StepError::Capability(_) => "capability",
            StepError::Panicked(_) => "panic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = StepError::Timeout(Duration::from_millis(100));
        assert_eq!(err.to_string(), "timed out after 0.1s");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_capability_error_is_transparent() {
        let err = StepError::from(CapabilityError::failed("disk full"));
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(err.kind(), "capability");
    }

    #[test]
    fn test_invalid_plan_lists_issues() {
        let err = EngineError::InvalidPlan(vec![
            PlanIssue::EmptyPlan,
            PlanIssue::SelfFallback { step: "a".into() },
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid plan: plan has no steps; step 'a' lists itself as a fallback"
        );
    }
}
