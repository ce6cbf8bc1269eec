//! Execution of one scheduled step and its fallback chain.
//!
//! A [`StepJob`] owns everything it needs (a snapshot of completed outputs,
//! the run inputs and the registry) so it can run on its own task and hand
//! its results back to the coordinator.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_plan::Step;
use trellis_registry::{CapabilityRegistry, InvocationContext, apply_defaults, validate_params};

use crate::context::RunInputs;
use crate::error::StepError;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::resolve::ParameterResolver;
use crate::result::{Attempt, ExecutionResult, StepStatus};

pub(crate) struct StepJob {
    pub step: Step,
    /// Fallback steps in declared order.
    pub fallbacks: Vec<Step>,
    pub registry: Arc<CapabilityRegistry>,
    pub outputs: HashMap<String, Value>,
    pub inputs: Arc<RunInputs>,
    pub run_id: String,
    pub session_id: String,
    pub default_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub progress: ProgressSink,
}

pub(crate) struct StepOutcome {
    pub step_id: String,
    /// Primary result first, then one per fallback tried.
    pub results: Vec<ExecutionResult>,
    /// Fallback id and output that stood in for the step.
    pub recovered: Option<(String, Value)>,
}

impl StepJob {
    /// Run the step, converting any escaped panic into a failed result.
    pub async fn run_guarded(self) -> StepOutcome {
        let step_id = self.step.id.clone();
        match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => StepOutcome {
                results: vec![ExecutionResult::failed(
                    &step_id,
                    StepError::Panicked(panic_message(payload.as_ref())).to_string(),
                )],
                step_id,
                recovered: None,
            },
        }
    }

    async fn run(self) -> StepOutcome {
        let mut results = vec![self.attempt(&self.step, Attempt::Primary).await];
        let mut recovered = None;

        if !results[0].is_success() && !self.cancel.is_cancelled() {
            for fallback in &self.fallbacks {
                if self.cancel.is_cancelled() {
                    break;
                }
                info!(
                    run_id = %self.run_id,
                    step_id = %self.step.id,
                    fallback = %fallback.id,
                    "Trying fallback"
                );
                let result = self
                    .attempt(fallback, Attempt::Fallback)
                    .await
                    .with_meta("fallback_for", json!(self.step.id));
                let succeeded = result.is_success();
                if succeeded {
                    recovered = Some((
                        fallback.id.clone(),
                        result.output.clone().unwrap_or(Value::Null),
                    ));
                }
                results.push(result);
                if succeeded {
                    break;
                }
            }
            if let Some((by, _)) = &recovered {
                results[0]
                    .metadata
                    .insert("recovered_by".to_string(), json!(by));
            }
        }

        if recovered.is_none() && results[0].status == StepStatus::Failed {
            let alternatives = self.registry.suggest_alternatives(&self.step.capability);
            if !alternatives.is_empty() {
                debug!(
                    run_id = %self.run_id,
                    step_id = %self.step.id,
                    alternatives = ?alternatives,
                    "Unrecovered failure; same-category capabilities available"
                );
                results[0]
                    .metadata
                    .insert("alternatives".to_string(), json!(alternatives));
            }
        }

        StepOutcome {
            step_id: self.step.id.clone(),
            results,
            recovered,
        }
    }

    async fn attempt(&self, step: &Step, attempt: Attempt) -> ExecutionResult {
        self.progress.emit(ProgressEvent::step_started(
            &self.run_id,
            &step.id,
            &step.capability,
            attempt,
        ));
        let started = Instant::now();
        let outcome = self.invoke(step).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok((output, confidence)) => ExecutionResult::completed(&step.id, output, confidence),
            Err(err) if err.is_cancellation() => ExecutionResult::cancelled(&step.id),
            Err(err) => {
                warn!(
                    run_id = %self.run_id,
                    step_id = %step.id,
                    capability = %step.capability,
                    error = %err,
                    "Step failed"
                );
                ExecutionResult::failed(&step.id, err.to_string())
                    .with_meta("error_kind", json!(err.kind()))
            }
        };
        result
            .with_duration(elapsed)
            .with_meta("capability", json!(step.capability))
            .with_meta("attempt", json!(attempt.as_str()))
    }

    /// Resolve, validate and invoke. Returns the output and its confidence.
    async fn invoke(&self, step: &Step) -> Result<(Value, f64), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let registered = self
            .registry
            .get(&step.capability)
            .ok_or_else(|| StepError::CapabilityNotFound(step.capability.clone()))?;
        let descriptor = &registered.descriptor;

        let mut params =
            ParameterResolver::new(&self.outputs, &self.inputs).resolve_params(&step.parameters)?;
        apply_defaults(descriptor, &mut params);

        let validation = validate_params(descriptor, &params);
        if !validation.is_ok() {
            return Err(StepError::InvalidParameters(validation.error_summary()));
        }
        for issue in &validation.warnings {
            warn!(step_id = %step.id, capability = %step.capability, "{}", issue);
        }

        let ctx = InvocationContext::new(&self.run_id, &self.session_id, &step.id)
            .with_cancellation(self.cancel.child_token());
        debug!(run_id = %self.run_id, step_id = %step.id, capability = %step.capability, "Invoking capability");

        let call = async {
            match AssertUnwindSafe(registered.handler.invoke(params, &ctx))
                .catch_unwind()
                .await
            {
                Ok(result) => result.map_err(StepError::from),
                Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
            }
        };

        let output = match step.timeout_duration().or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StepError::Timeout(limit))??,
            None => call.await?,
        };
        Ok((output, descriptor.reliability.weight()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
