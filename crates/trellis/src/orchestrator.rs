//! The orchestrator facade.
//!
//! Wires a capability registry, a state store and the execution engine
//! together and exposes the two ways to run a plan: to completion, or as a
//! stream of progress events.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use trellis_config::TrellisConfig;
use trellis_engine::{
    Engine, EngineConfig, ExecutionResult, ProgressEvent, ProgressSink, RunContext, RunSummary,
    TraceEntry,
};
use trellis_plan::{Plan, ValidationReport, validate_plan};
use trellis_registry::CapabilityRegistry;
use trellis_state::{StateStore, SweeperHandle};

use crate::error::{OrchestratorError, Result};

/// Stream of progress events for one run.
pub type RunStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send + 'static>>;

/// Session used when a caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

// ─────────────────────────────────────────────────────────────────────────────
// Request / report
// ─────────────────────────────────────────────────────────────────────────────

/// What to run a plan with.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub session_id: String,
    /// Originating request payload, reachable through `@key`.
    pub request: Value,
    /// Named inputs, reachable through `@key` ahead of the request.
    pub inputs: Map<String, Value>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION)
    }
}

impl RunRequest {
    /// A request in `session_id` with a fresh run id.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            request: Value::Null,
            inputs: Map::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request = request;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    fn into_context(self) -> RunContext {
        RunContext::new(self.run_id, self.session_id)
            .with_request(self.request)
            .with_inputs(self.inputs)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub session_id: String,
    /// One entry per attempted step, fallbacks included.
    pub results: Vec<ExecutionResult>,
    /// Outputs visible to references at the end of the run.
    pub outputs: HashMap<String, Value>,
    pub summary: RunSummary,
    pub trace: Vec<TraceEntry>,
    /// Pre-execution validation of the plan.
    pub validation: ValidationReport,
    /// Steps that could never become ready.
    pub stuck: Vec<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn result(&self, step_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Primary steps that failed with no fallback standing in for them.
    pub fn unrecovered_failures(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.is_unrecovered_failure())
            .map(|r| r.step_id.as_str())
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for running plans.
///
/// Cheap to share behind an `Arc`; several runs may execute concurrently
/// against the same registry and store.
pub struct Orchestrator {
    engine: Arc<Engine>,
    _sweeper: Option<SweeperHandle>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(registry, store, config)),
            _sweeper: None,
        }
    }

    /// Build the store and engine from a loaded config.
    ///
    /// When `[state] sweep_interval_secs` is set a background sweeper is
    /// started, so this must be called from within a tokio runtime.
    pub fn from_config(config: &TrellisConfig, registry: CapabilityRegistry) -> Result<Self> {
        let state = config.state();
        let store = Arc::new(StateStore::from_config(&state)?);
        let sweeper = state
            .sweep_interval()
            .map(|interval| store.spawn_sweeper(interval));
        let engine = Engine::new(
            Arc::new(registry),
            store,
            EngineConfig::from(&config.engine()),
        );
        Ok(Self {
            engine: Arc::new(engine),
            _sweeper: sweeper,
        })
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.engine.registry()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        self.engine.store()
    }

    pub fn engine_config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// Validate `plan` against the registry without running it.
    pub fn validate(&self, plan: &Plan) -> ValidationReport {
        validate_plan(plan, self.registry())
    }

    /// Run `plan` to completion.
    ///
    /// Fails only on structural plan errors. Non-structural validation
    /// errors (unknown capability, malformed condition) are logged and left
    /// to surface as failed or skipped steps.
    pub async fn execute(&self, plan: &Plan, request: RunRequest) -> Result<RunReport> {
        self.execute_with_cancel(plan, request, CancellationToken::new())
            .await
    }

    /// Run `plan` until it completes or `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        plan: &Plan,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let validation = self.checked_validation(plan)?;
        let session_id = request.session_id.clone();
        let outcome = self
            .engine
            .execute_with_cancel(plan, request.into_context(), cancel)
            .await?;

        Ok(RunReport {
            run_id: outcome.context.run_id.clone(),
            session_id,
            results: outcome.results,
            outputs: outcome.context.outputs,
            summary: outcome.summary,
            trace: outcome.context.trace,
            validation,
            stuck: outcome.stuck,
            cancelled: outcome.cancelled,
        })
    }

    /// Run `plan`, yielding progress events as they happen.
    ///
    /// The stream ends with a `final` event, or with a single `error` event
    /// when the plan cannot run. Dropping the stream cancels the run.
    pub fn execute_streaming(&self, plan: Plan, request: RunRequest) -> RunStream {
        let engine = Arc::clone(&self.engine);
        let validation = self.checked_validation(&plan);

        Box::pin(async_stream::stream! {
            let run_id = request.run_id.clone();
            if let Err(e) = validation {
                yield ProgressEvent::error(&run_id, e.to_string());
                return;
            }

            let cancel = CancellationToken::new();
            let _guard = cancel.clone().drop_guard();
            let (sink, mut rx) = ProgressSink::channel();
            let task = tokio::spawn(async move {
                engine
                    .execute_with_progress(&plan, request.into_context(), sink, cancel)
                    .await
            });

            let mut finished = false;
            while let Some(event) = rx.recv().await {
                finished |= event.is_final();
                yield event;
            }

            let failure = match task.await {
                Ok(Ok(_)) if finished => None,
                Ok(Ok(_)) => Some("run ended without a final event".to_string()),
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("run task failed: {e}")),
            };
            if let Some(message) = failure {
                yield ProgressEvent::error(&run_id, message);
            }
        })
    }

    /// Drop every session entry and run of `session_id`.
    pub fn cleanup(&self, session_id: &str) -> usize {
        let removed = self.store().cleanup_session(session_id);
        info!(session_id, removed, "Session cleaned up");
        removed
    }

    /// Drop the run and step entries of one run.
    pub fn cleanup_run(&self, run_id: &str) -> usize {
        self.store().cleanup_run(run_id)
    }

    fn checked_validation(&self, plan: &Plan) -> Result<ValidationReport> {
        let validation = self.validate(plan);
        if validation.has_structural_errors() {
            return Err(OrchestratorError::InvalidPlan(validation.structural_errors()));
        }
        for issue in &validation.errors {
            warn!(plan_id = %plan.id, issue = %issue, "Plan validation error");
        }
        Ok(validation)
    }
}
