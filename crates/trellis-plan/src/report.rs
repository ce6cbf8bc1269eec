//! Validation findings and the plan-level report.

use serde::Serialize;

/// A single finding about a plan.
///
/// Structural issues (see [`PlanIssue::is_structural`]) make a plan
/// unexecutable. Everything else is advisory and only lowers confidence.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanIssue {
    #[error("plan has no steps")]
    EmptyPlan,

    #[error("step id cannot be empty")]
    EmptyStepId,

    #[error("duplicate step id '{step}'")]
    DuplicateStep { step: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    #[error("step '{step}' has unknown fallback '{fallback}'")]
    DanglingFallback { step: String, fallback: String },

    #[error("step '{step}' lists itself as a fallback")]
    SelfFallback { step: String },

    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicPlan { cycle: Vec<String> },

    #[error("step '{step}' uses unknown capability '{capability}'")]
    UnknownCapability { step: String, capability: String },

    #[error("step '{step}' has malformed condition '{expression}': {reason}")]
    MalformedCondition {
        step: String,
        expression: String,
        reason: String,
    },

    #[error("step '{step}' condition references unknown step '{referenced}'")]
    UnknownConditionStep { step: String, referenced: String },

    #[error("step '{step}' condition references '{referenced}', which is not a dependency")]
    ConditionNotDependency { step: String, referenced: String },

    #[error("step '{step}' parameter '{parameter}' references unknown step '{referenced}'")]
    UnknownReference {
        step: String,
        parameter: String,
        referenced: String,
    },

    #[error(
        "step '{step}' parameter '{parameter}' references '{referenced}', which is not upstream"
    )]
    ReferenceNotUpstream {
        step: String,
        parameter: String,
        referenced: String,
    },

    #[error("step '{step}' waits on fallback step '{fallback}', which only runs when a primary fails")]
    DependsOnFallback { step: String, fallback: String },

    #[error("step '{step}': {message}")]
    Parameter {
        step: String,
        parameter: String,
        message: String,
    },
}

impl PlanIssue {
    /// Whether this issue aborts a run before any step executes.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PlanIssue::EmptyPlan
                | PlanIssue::EmptyStepId
                | PlanIssue::DuplicateStep { .. }
                | PlanIssue::DanglingDependency { .. }
                | PlanIssue::DanglingFallback { .. }
                | PlanIssue::SelfFallback { .. }
                | PlanIssue::CyclicPlan { .. }
        )
    }

    /// Step the issue is attached to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            PlanIssue::EmptyPlan | PlanIssue::EmptyStepId | PlanIssue::CyclicPlan { .. } => None,
            PlanIssue::DuplicateStep { step }
            | PlanIssue::DanglingDependency { step, .. }
            | PlanIssue::DanglingFallback { step, .. }
            | PlanIssue::SelfFallback { step }
            | PlanIssue::UnknownCapability { step, .. }
            | PlanIssue::MalformedCondition { step, .. }
            | PlanIssue::UnknownConditionStep { step, .. }
            | PlanIssue::ConditionNotDependency { step, .. }
            | PlanIssue::UnknownReference { step, .. }
            | PlanIssue::ReferenceNotUpstream { step, .. }
            | PlanIssue::DependsOnFallback { step, .. }
            | PlanIssue::Parameter { step, .. } => Some(step),
        }
    }
}

/// Outcome of validating a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Findings that make the plan invalid.
    pub errors: Vec<PlanIssue>,
    /// Findings that only lower confidence.
    pub warnings: Vec<PlanIssue>,
    /// Advisory score in `[0, 1]`.
    pub confidence: f64,
}

impl ValidationReport {
    /// True when there are no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// True when an error would make execution impossible.
    pub fn has_structural_errors(&self) -> bool {
        self.errors.iter().any(PlanIssue::is_structural)
    }

    /// The structural errors only.
    pub fn structural_errors(&self) -> Vec<PlanIssue> {
        self.errors
            .iter()
            .filter(|e| e.is_structural())
            .cloned()
            .collect()
    }

    /// All errors and warnings attached to `step_id`.
    pub fn issues_for(&self, step_id: &str) -> Vec<&PlanIssue> {
        self.errors
            .iter()
            .chain(&self.warnings)
            .filter(|i| i.step() == Some(step_id))
            .collect()
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} errors, {} warnings, confidence {:.2})",
            if self.is_valid() { "valid" } else { "invalid" },
            self.errors.len(),
            self.warnings.len(),
            self.confidence
        )
    }
}
