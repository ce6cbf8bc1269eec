//! Step results and run summaries.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Whether the step can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a result comes from the step itself or stands in for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attempt {
    Primary,
    Fallback,
}

impl Attempt {
    pub fn as_str(self) -> &'static str {
        match self {
            Attempt::Primary => "primary",
            Attempt::Fallback => "fallback",
        }
    }
}

/// Outcome of one attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Capability output, present only when COMPLETED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent in the attempt, in seconds.
    pub duration_secs: f64,
    /// Capability reliability weight when COMPLETED, zero otherwise.
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output: None,
            error: None,
            duration_secs: 0.0,
            confidence: 0.0,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(step_id: impl Into<String>, output: Value, confidence: f64) -> Self {
        Self {
            output: Some(output),
            confidence,
            ..Self::new(step_id, StepStatus::Completed)
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(step_id, StepStatus::Failed)
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(step_id, StepStatus::Skipped).with_meta("reason", Value::String(reason.into()))
    }

    pub fn cancelled(step_id: impl Into<String>) -> Self {
        Self {
            error: Some("cancelled".to_string()),
            ..Self::new(step_id, StepStatus::Cancelled)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_secs = duration.as_secs_f64();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Fallback that stood in for this step, if any.
    pub fn recovered_by(&self) -> Option<&str> {
        self.metadata.get("recovered_by").and_then(Value::as_str)
    }

    /// Step this result was a fallback for, if any.
    pub fn fallback_for(&self) -> Option<&str> {
        self.metadata.get("fallback_for").and_then(Value::as_str)
    }

    /// A failed primary attempt that no fallback stood in for.
    pub fn is_unrecovered_failure(&self) -> bool {
        self.status == StepStatus::Failed
            && self.recovered_by().is_none()
            && self.fallback_for().is_none()
    }
}

/// Aggregate view of a run's results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Failed steps whose fallback succeeded.
    pub recovered: usize,
    /// `completed / total`.
    pub success_rate: f64,
    /// Run wall time in seconds.
    pub total_time: f64,
    /// Mean result confidence.
    pub average_confidence: f64,
}

impl RunSummary {
    pub fn from_results(results: &[ExecutionResult], elapsed: Duration) -> Self {
        let count = |status: StepStatus| results.iter().filter(|r| r.status == status).count();
        let total = results.len();
        let completed = count(StepStatus::Completed);
        let (success_rate, average_confidence) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                completed as f64 / total as f64,
                results.iter().map(|r| r.confidence).sum::<f64>() / total as f64,
            )
        };

        Self {
            total,
            completed,
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
            cancelled: count(StepStatus::Cancelled),
            recovered: results.iter().filter(|r| r.recovered_by().is_some()).count(),
            success_rate,
            total_time: elapsed.as_secs_f64(),
            average_confidence,
        }
    }
}
