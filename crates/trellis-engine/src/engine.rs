//! The execution engine.
//!
//! Drives a plan to completion: steps become ready incrementally as their
//! dependencies resolve, ready steps run concurrently up to
//! `max_parallel_steps`, and the coordinator waits for at least one in-flight
//! step to finish before re-evaluating readiness. Workers return their
//! results to the coordinator, which is the only writer of run bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_config::{ConditionPolicy, EngineSection};
use trellis_plan::{Plan, Readiness, Step};
use trellis_registry::CapabilityRegistry;
use trellis_state::{Scope, ScopeIds, SetOptions, StateStore};

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::result::{ExecutionResult, RunSummary, StepStatus};
use crate::step::{StepJob, StepOutcome};

/// Step-scope key under which each completed step's output is stored.
pub const STEP_OUTPUT_KEY: &str = "output";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on steps running at once within one run.
    pub max_parallel_steps: usize,
    /// Applied to steps that declare no timeout.
    pub default_step_timeout: Option<Duration>,
    /// Handling of CUSTOM conditions that fail to parse.
    pub condition_policy: ConditionPolicy,
    /// Save the run context into the store's run scope when a run ends.
    pub persist_run_context: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            max_parallel_steps: section.max_parallel_steps.max(1),
            default_step_timeout: section.default_step_timeout(),
            condition_policy: section.condition_policy,
            persist_run_context: section.persist_run_context,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max.max(1);
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    pub fn with_condition_policy(mut self, policy: ConditionPolicy) -> Self {
        self.condition_policy = policy;
        self
    }

    pub fn with_persist_run_context(mut self, persist: bool) -> Self {
        self.persist_run_context = persist;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// One result per attempted step, in the order they were recorded.
    pub results: Vec<ExecutionResult>,
    /// Final run context (outputs, confidences, trace).
    pub context: RunContext,
    pub summary: RunSummary,
    /// Steps that could never become ready.
    pub stuck: Vec<String>,
    /// Whether the run was cancelled before it finished.
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn result(&self, step_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.result(step_id).map(|r| r.status)
    }

    /// Results keyed by step id.
    pub fn results_by_step(&self) -> HashMap<&str, &ExecutionResult> {
        self.results
            .iter()
            .map(|r| (r.step_id.as_str(), r))
            .collect()
    }

    /// True when the run hit a stuck condition.
    pub fn is_stuck(&self) -> bool {
        !self.stuck.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// Per-run step states, owned by the coordinator.
struct Tracker<'p> {
    steps: Vec<&'p Step>,
    status: HashMap<&'p str, StepStatus>,
    /// Satisfied for scheduling: COMPLETED, or FAILED but recovered.
    completed: HashSet<String>,
    failed: HashSet<String>,
    /// SKIPPED or CANCELLED.
    blocked: HashSet<String>,
    /// Fallback-only step id -> primaries that may still attempt it.
    fallback_owners: HashMap<String, HashSet<String>>,
    /// Best status seen for each fallback-only step that was attempted.
    fallback_attempts: HashMap<String, StepStatus>,
}

impl<'p> Tracker<'p> {
    fn new(steps: Vec<&'p Step>, fallback_ids: &HashSet<&str>) -> Self {
        let status = steps
            .iter()
            .copied()
            .map(|s| (s.id.as_str(), StepStatus::Pending))
            .collect();
        let mut fallback_owners: HashMap<String, HashSet<String>> = fallback_ids
            .iter()
            .map(|id| (id.to_string(), HashSet::new()))
            .collect();
        for step in &steps {
            for fallback in &step.fallbacks {
                if let Some(owners) = fallback_owners.get_mut(fallback.as_str()) {
                    owners.insert(step.id.clone());
                }
            }
        }
        let orphans: Vec<String> = fallback_owners
            .iter()
            .filter(|(_, owners)| owners.is_empty())
            .map(|(id, _)| id.clone())
            .collect();

        let mut tracker = Self {
            steps,
            status,
            completed: HashSet::new(),
            failed: HashSet::new(),
            blocked: HashSet::new(),
            fallback_owners,
            fallback_attempts: HashMap::new(),
        };
        // Only named by other fallbacks, so never attempted.
        for id in orphans {
            tracker.settle_fallback(&id);
        }
        tracker
    }

    fn is_pending(&self, id: &str) -> bool {
        self.status.get(id) == Some(&StepStatus::Pending)
    }

    fn pending(&self) -> Vec<&'p Step> {
        self.steps
            .iter()
            .copied()
            .filter(|s| self.is_pending(&s.id))
            .collect()
    }

    fn set(&mut self, id: &str, status: StepStatus) {
        if let Some(slot) = self.status.get_mut(id) {
            *slot = status;
        }
    }

    /// Skip every pending step that can no longer run and return the ready
    /// ones in declaration order. Repeats until no new step is skipped, so a
    /// skip propagates through chains of dependents in one call.
    fn advance(
        &mut self,
        policy: ConditionPolicy,
        skipped: &mut Vec<ExecutionResult>,
    ) -> Vec<&'p Step> {
        loop {
            let mut ready = Vec::new();
            let mut changed = false;

            for step in self.pending() {
                let blocked_dep = step
                    .dependencies
                    .iter()
                    .find(|d| self.blocked.contains(d.as_str()));
                let decision = match blocked_dep {
                    Some(dep) => Readiness::Skip(format!("dependency '{dep}' did not run")),
                    None => step.readiness(&self.completed, &self.failed, policy),
                };

                match decision {
                    Readiness::Ready => ready.push(step),
                    Readiness::Waiting => {}
                    Readiness::Skip(reason) => {
                        debug!(step_id = %step.id, reason = %reason, "Skipping step");
                        self.resolve(&step.id, StepStatus::Skipped, false);
                        skipped.push(
                            ExecutionResult::skipped(&step.id, reason)
                                .with_meta("capability", Value::String(step.capability.clone())),
                        );
                        changed = true;
                    }
                }
            }

            if !changed {
                return ready;
            }
        }
    }

    /// Record the primary outcome of a step.
    fn resolve(&mut self, id: &str, status: StepStatus, recovered: bool) {
        self.set(id, status);
        match status {
            StepStatus::Completed => {
                self.completed.insert(id.to_string());
            }
            StepStatus::Failed if recovered => {
                self.completed.insert(id.to_string());
            }
            StepStatus::Failed => {
                self.failed.insert(id.to_string());
            }
            _ => {
                self.blocked.insert(id.to_string());
            }
        }
        self.release_fallbacks(id);
    }

    /// Note one attempt of a fallback-only step.
    fn note_fallback_attempt(&mut self, id: &str, status: StepStatus) {
        let rank = |s: StepStatus| match s {
            StepStatus::Completed => 2,
            StepStatus::Failed => 1,
            _ => 0,
        };
        let best = self
            .fallback_attempts
            .entry(id.to_string())
            .or_insert(status);
        if rank(status) > rank(*best) {
            *best = status;
        }
    }

    /// Drop `primary` from the owners of its fallbacks, settling each
    /// fallback no other pending primary can still attempt.
    fn release_fallbacks(&mut self, primary: &str) {
        let settled: Vec<String> = self
            .fallback_owners
            .iter_mut()
            .filter_map(|(id, owners)| {
                (owners.remove(primary) && owners.is_empty()).then(|| id.clone())
            })
            .collect();
        for id in settled {
            self.settle_fallback(&id);
        }
    }

    /// Resolve a fallback-only step from its attempts: its best attempt
    /// status, or blocked when it was never attempted.
    fn settle_fallback(&mut self, id: &str) {
        let status = self
            .fallback_attempts
            .get(id)
            .copied()
            .unwrap_or(StepStatus::Skipped);
        debug!(step_id = %id, status = %status, "Fallback step resolved");
        match status {
            StepStatus::Completed => {
                self.completed.insert(id.to_string());
            }
            StepStatus::Failed => {
                self.failed.insert(id.to_string());
            }
            _ => {
                self.blocked.insert(id.to_string());
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Runs plans against a capability registry and a state store.
///
/// The registry is read-only at run time and the store is internally
/// synchronized, so one engine can drive several runs concurrently.
pub struct Engine {
    registry: Arc<CapabilityRegistry>,
    store: Arc<StateStore>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `plan` to completion.
    pub async fn execute(&self, plan: &Plan, context: RunContext) -> Result<RunOutcome> {
        self.execute_with_progress(plan, context, ProgressSink::none(), CancellationToken::new())
            .await
    }

    /// Run `plan` until it completes or `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        plan: &Plan,
        context: RunContext,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.execute_with_progress(plan, context, ProgressSink::none(), cancel)
            .await
    }

    /// Run `plan`, reporting progress to `progress`.
    ///
    /// Fails only when the plan is structurally invalid. Step failures,
    /// timeouts, stuck steps and cancellation are all reported through the
    /// returned outcome.
    pub async fn execute_with_progress(
        &self,
        plan: &Plan,
        mut context: RunContext,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let issues = plan.structural_issues();
        if !issues.is_empty() {
            return Err(EngineError::InvalidPlan(issues));
        }

        let started = Instant::now();
        let run_id = context.run_id.clone();
        let max_parallel = self.config.max_parallel_steps.max(1);
        self.store.register_run(&run_id, &context.session_id);

        let fallback_ids = plan.fallback_ids();
        let scheduled: Vec<&Step> = plan
            .steps
            .iter()
            .filter(|s| !fallback_ids.contains(s.id.as_str()))
            .collect();

        info!(
            run_id = %run_id,
            plan_id = %plan.id,
            steps = scheduled.len(),
            max_parallel,
            "Starting run"
        );
        progress.emit(ProgressEvent::status(
            &run_id,
            format!("starting plan '{}' with {} steps", plan.id, scheduled.len()),
        ));

        let inputs = Arc::new(context.inputs.clone());
        let mut tracker = Tracker::new(scheduled, &fallback_ids);
        let mut results = Vec::new();
        let mut running: JoinSet<StepOutcome> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut stuck = Vec::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut skipped = Vec::new();
            let ready = tracker.advance(self.config.condition_policy, &mut skipped);
            for result in skipped {
                self.record(&mut context, &mut results, &progress, result);
            }

            let capacity = max_parallel - in_flight.len();
            for step in ready.into_iter().take(capacity) {
                debug!(run_id = %run_id, step_id = %step.id, "Launching step");
                tracker.set(&step.id, StepStatus::Running);
                in_flight.insert(step.id.clone());
                let job = StepJob {
                    step: step.clone(),
                    fallbacks: step
                        .fallbacks
                        .iter()
                        .filter_map(|id| plan.step(id))
                        .cloned()
                        .collect(),
                    registry: Arc::clone(&self.registry),
                    outputs: context.outputs.clone(),
                    inputs: Arc::clone(&inputs),
                    run_id: run_id.clone(),
                    session_id: context.session_id.clone(),
                    default_timeout: self.config.default_step_timeout,
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                };
                running.spawn(job.run_guarded());
            }

            if in_flight.is_empty() {
                let remaining = tracker.pending();
                if !remaining.is_empty() {
                    stuck = remaining.iter().map(|s| s.id.clone()).collect();
                    error!(run_id = %run_id, steps = ?stuck, "Run is stuck: no step can become ready");
                    progress.emit(ProgressEvent::error(
                        &run_id,
                        format!("run stuck; skipping {}", stuck.join(", ")),
                    ));
                    for step in remaining {
                        tracker.resolve(&step.id, StepStatus::Skipped, false);
                        let result = ExecutionResult::skipped(
                            &step.id,
                            "stuck: waiting on steps that will never resolve",
                        )
                        .with_meta("capability", Value::String(step.capability.clone()))
                        .with_meta("stuck", Value::Bool(true));
                        self.record(&mut context, &mut results, &progress, result);
                    }
                }
                break;
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        in_flight.remove(&outcome.step_id);
                        self.absorb(outcome, &mut tracker, &mut context, &mut results, &progress);
                    }
                    Some(Err(e)) => error!(run_id = %run_id, error = %e, "Step task failed to join"),
                    None => {}
                },
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            running.abort_all();
            while let Some(joined) = running.join_next().await {
                if let Ok(outcome) = joined {
                    in_flight.remove(&outcome.step_id);
                    self.absorb(outcome, &mut tracker, &mut context, &mut results, &progress);
                }
            }
            let unfinished: Vec<&Step> = tracker
                .steps
                .iter()
                .copied()
                .filter(|s| in_flight.contains(&s.id) || tracker.is_pending(&s.id))
                .collect();
            warn!(run_id = %run_id, unfinished = unfinished.len(), "Run cancelled");
            for step in unfinished {
                tracker.resolve(&step.id, StepStatus::Cancelled, false);
                let result = ExecutionResult::cancelled(&step.id)
                    .with_meta("capability", Value::String(step.capability.clone()));
                self.record(&mut context, &mut results, &progress, result);
            }
        }

        if self.config.persist_run_context {
            self.persist_context(&context);
        }

        let summary = RunSummary::from_results(&results, started.elapsed());
        info!(
            run_id = %run_id,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            total_time = summary.total_time,
            "Run finished"
        );
        progress.emit(ProgressEvent::final_summary(
            &run_id,
            summary.clone(),
            stuck.clone(),
        ));

        Ok(RunOutcome {
            results,
            context,
            summary,
            stuck,
            cancelled,
        })
    }

    /// Fold a finished worker's results into the run.
    fn absorb(
        &self,
        outcome: StepOutcome,
        tracker: &mut Tracker<'_>,
        context: &mut RunContext,
        results: &mut Vec<ExecutionResult>,
        progress: &ProgressSink,
    ) {
        let StepOutcome {
            step_id,
            results: attempts,
            recovered,
        } = outcome;
        let primary_status = attempts
            .first()
            .map(|r| r.status)
            .unwrap_or(StepStatus::Failed);

        for result in attempts {
            if result.step_id != step_id {
                tracker.note_fallback_attempt(&result.step_id, result.status);
            }
            self.record(context, results, progress, result);
        }

        if let Some((fallback_id, output)) = recovered {
            info!(step_id = %step_id, fallback = %fallback_id, "Step recovered by fallback");
            context.set_output(&step_id, output);
            tracker.resolve(&step_id, primary_status, true);
        } else {
            tracker.resolve(&step_id, primary_status, false);
        }
    }

    /// Record one result: output, trace, store and progress.
    fn record(
        &self,
        context: &mut RunContext,
        results: &mut Vec<ExecutionResult>,
        progress: &ProgressSink,
        result: ExecutionResult,
    ) {
        if let Some(output) = result.output.as_ref().filter(|_| result.is_success()) {
            context.set_output(&result.step_id, output.clone());
            let ids = ScopeIds::step(&context.run_id, &result.step_id);
            if let Err(e) = self.store.set(
                STEP_OUTPUT_KEY,
                output.clone(),
                Scope::Step,
                &ids,
                SetOptions::new(),
            ) {
                warn!(step_id = %result.step_id, error = %e, "Failed to store step output");
            }
        }

        info!(
            run_id = %context.run_id,
            step_id = %result.step_id,
            status = %result.status,
            duration_secs = result.duration_secs,
            "Step finished"
        );
        context.record(&result);
        progress.emit(ProgressEvent::step_finished(&context.run_id, result.clone()));
        results.push(result);
    }

    fn persist_context(&self, context: &RunContext) {
        let saved = serde_json::to_value(context)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                self.store
                    .save_run_context(&context.run_id, value)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = saved {
            warn!(run_id = %context.run_id, error = %e, "Failed to persist run context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_plan::Condition;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_from_section() {
        let section = EngineSection {
            max_parallel_steps: 0,
            default_step_timeout_secs: Some(1.5),
            ..Default::default()
        };
        let config = EngineConfig::from(&section);
        assert_eq!(config.max_parallel_steps, 1);
        assert_eq!(
            config.default_step_timeout,
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.condition_policy, ConditionPolicy::FailClosed);

        let oversized = EngineSection {
            default_step_timeout_secs: Some(1e30),
            ..Default::default()
        };
        assert!(EngineConfig::from(&oversized).default_step_timeout.is_none());
    }

    #[test]
    fn test_tracker_propagates_skips() {
        let a = Step::new("a", "x");
        let b = Step::new("b", "x").depends_on("a");
        let c = Step::new("c", "x")
            .depends_on("b")
            .condition(Condition::Always);
        let d = Step::new("d", "x")
            .depends_on("a")
            .condition(Condition::OnFailure);
        let mut tracker = Tracker::new(vec![&a, &b, &c, &d], &HashSet::new());

        let mut skipped = Vec::new();
        let ready = tracker.advance(ConditionPolicy::FailClosed, &mut skipped);
        assert_eq!(ready.len(), 1);
        assert!(skipped.is_empty());

        tracker.resolve("a", StepStatus::Failed, false);
        let ready = tracker.advance(ConditionPolicy::FailClosed, &mut skipped);
        let ready: Vec<&str> = ready.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["d"]);
        let skipped_ids: Vec<&str> = skipped.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(skipped_ids, vec!["b", "c"]);
        assert_eq!(tracker.blocked, ids(&["b", "c"]));
    }

    #[test]
    fn test_recovered_failure_satisfies_dependents() {
        let a = Step::new("a", "x");
        let b = Step::new("b", "x").depends_on("a");
        let mut tracker = Tracker::new(vec![&a, &b], &HashSet::new());
        tracker.resolve("a", StepStatus::Failed, true);
        let mut skipped = Vec::new();
        let ready = tracker.advance(ConditionPolicy::FailClosed, &mut skipped);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");
        assert_eq!(tracker.status["a"], StepStatus::Failed);
    }

    #[test]
    fn test_used_fallback_resolves_for_dependents() {
        let a = Step::new("a", "x").fallback("b");
        let c = Step::new("c", "x").depends_on("b");
        let fallbacks: HashSet<&str> = ["b"].into_iter().collect();
        let mut tracker = Tracker::new(vec![&a, &c], &fallbacks);

        let mut skipped = Vec::new();
        let ready = tracker.advance(ConditionPolicy::FailClosed, &mut skipped);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "a");

        tracker.note_fallback_attempt("b", StepStatus::Completed);
        tracker.resolve("a", StepStatus::Failed, true);
        let ready = tracker.advance(ConditionPolicy::FailClosed, &mut skipped);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "c");
        assert!(tracker.completed.contains("b"));
    }

    #[test]
    fn test_unused_fallback_blocks_dependents() {
        let a = Step::new("a", "x").fallback("b");
        let c = Step::new("c", "x").depends_on("b");
        let fallbacks: HashSet<&str> = ["b"].into_iter().collect();
        let mut tracker = Tracker::new(vec![&a, &c], &fallbacks);

        tracker.resolve("a", StepStatus::Completed, false);
        let mut skipped = Vec::new();
        assert!(tracker.advance(ConditionPolicy::FailClosed, &mut skipped).is_empty());
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].step_id, "c");
        assert_eq!(tracker.blocked, ids(&["b", "c"]));
    }

    #[test]
    fn test_shared_fallback_waits_for_every_primary() {
        let a = Step::new("a", "x").fallback("f");
        let b = Step::new("b", "x").fallback("f");
        let fallbacks: HashSet<&str> = ["f"].into_iter().collect();
        let mut tracker = Tracker::new(vec![&a, &b], &fallbacks);

        tracker.note_fallback_attempt("f", StepStatus::Failed);
        tracker.resolve("a", StepStatus::Failed, false);
        assert!(!tracker.failed.contains("f"));

        tracker.note_fallback_attempt("f", StepStatus::Completed);
        tracker.resolve("b", StepStatus::Failed, true);
        assert!(tracker.completed.contains("f"));
        assert!(!tracker.failed.contains("f"));
    }
}
