//! Per-run context: inputs, step outputs and the trace log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::result::{ExecutionResult, StepStatus};

/// Read-only values available to `@key` references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInputs {
    /// Originating request payload.
    #[serde(default)]
    pub request: Value,
    /// Named inputs supplied by the caller.
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl RunInputs {
    /// Look up `key` in the named inputs, then in the request object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).or_else(|| self.request.get(key))
    }
}

/// One line of the append-only trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: StepStatus,
    /// JSON type of the output (`object`, `string`, ...) or `none`.
    pub output_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// State owned by the engine for the duration of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub session_id: String,
    pub inputs: RunInputs,
    /// Outputs visible to `$step` references.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub confidences: HashMap<String, f64>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.inputs.request = request;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.values.insert(key.into(), value);
        self
    }

    pub fn with_inputs(mut self, values: Map<String, Value>) -> Self {
        self.inputs.values.extend(values);
        self
    }

    /// Append a trace entry for `result` and remember its confidence.
    pub(crate) fn record(&mut self, result: &ExecutionResult) {
        self.confidences
            .insert(result.step_id.clone(), result.confidence);
        self.trace.push(TraceEntry {
            step_id: result.step_id.clone(),
            timestamp: result.timestamp,
            status: result.status,
            output_type: result
                .output
                .as_ref()
                .map(|v| trellis_registry::value_type_name(v).to_string())
                .unwrap_or_else(|| "none".to_string()),
            confidence: result.confidence,
            metadata: result.metadata.clone(),
        });
    }

    /// Make `output` visible to references to `step_id`.
    pub(crate) fn set_output(&mut self, step_id: &str, output: Value) {
        self.outputs.insert(step_id.to_string(), output);
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inputs_fall_back_to_request() {
        let ctx = RunContext::new("r", "s")
            .with_request(json!({"url": "https://req", "lang": "en"}))
            .with_input("url", json!("https://input"));
        assert_eq!(ctx.inputs.get("url"), Some(&json!("https://input")));
        assert_eq!(ctx.inputs.get("lang"), Some(&json!("en")));
        assert!(ctx.inputs.get("missing").is_none());
    }

    #[test]
    fn test_record_appends_trace() {
        let mut ctx = RunContext::new("r", "s");
        ctx.record(&ExecutionResult::completed("a", json!({"x": 1}), 0.8));
        ctx.record(&ExecutionResult::failed("b", "boom"));
        assert_eq!(ctx.trace.len(), 2);
        assert_eq!(ctx.trace[0].output_type, "object");
        assert_eq!(ctx.trace[1].output_type, "none");
        assert_eq!(ctx.confidences["a"], 0.8);
        assert_eq!(ctx.confidences["b"], 0.0);
    }
}
