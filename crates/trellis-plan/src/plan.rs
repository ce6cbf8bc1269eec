//! Steps, plans and plan files.
//!
//! # Example TOML
//!
//! ```toml
//! [plan]
//! id = "digest"
//! description = "Fetch a page and summarize it"
//!
//! [[plan.steps]]
//! id = "fetch"
//! capability = "web_fetch"
//! parameters = { url = "@url" }
//! timeout_secs = 10.0
//! fallbacks = ["fetch_cached"]
//!
//! [[plan.steps]]
//! id = "fetch_cached"
//! capability = "cache_lookup"
//! parameters = { key = "@url" }
//!
//! [[plan.steps]]
//! id = "summarize"
//! capability = "summarize"
//! parameters = { text = "$fetch.body" }
//! dependencies = ["fetch"]
//!
//! [[plan.steps]]
//! id = "report_failure"
//! capability = "notify"
//! dependencies = ["summarize"]
//! condition = "on_failure"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use trellis_config::ConditionPolicy;
use trellis_registry::Params;

use crate::condition::Condition;
use crate::error::{PlanError, Result};
use crate::report::PlanIssue;

// ─────────────────────────────────────────────────────────────────────────────
// Step
// ─────────────────────────────────────────────────────────────────────────────

/// One node of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the plan.
    pub id: String,

    /// Name of the capability to invoke.
    pub capability: String,

    /// Literal values or reference strings (`$step.field`, `@key`).
    #[serde(default, alias = "params")]
    pub parameters: Params,

    /// Steps that must be resolved before this one is considered.
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,

    /// Gate evaluated once dependencies are resolved.
    #[serde(default)]
    pub condition: Condition,

    /// Per-step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// Steps tried in order if this one fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

impl Step {
    /// Create a step with no parameters, dependencies or fallbacks.
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            parameters: Params::new(),
            dependencies: Vec::new(),
            condition: Condition::default(),
            timeout_secs: None,
            fallbacks: Vec::new(),
            description: String::new(),
        }
    }

    /// Set one parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Replace all parameters.
    pub fn params(mut self, parameters: Params) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn fallback(mut self, step_id: impl Into<String>) -> Self {
        self.fallbacks.push(step_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declared timeout. Values that are not positive, or too large for a
    /// `Duration`, mean none.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// Whether the step may run given resolved dependency outcomes.
    ///
    /// Every dependency must be in `completed` or `failed`. The condition
    /// then decides: ALWAYS runs, ON_SUCCESS runs when no dependency failed,
    /// ON_FAILURE runs when at least one did, CUSTOM runs when its expression
    /// is true. An unparseable CUSTOM expression follows `policy`.
    pub fn can_execute(
        &self,
        completed: &HashSet<String>,
        failed: &HashSet<String>,
        policy: ConditionPolicy,
    ) -> bool {
        self.readiness(completed, failed, policy) == Readiness::Ready
    }

    /// Detailed form of [`Step::can_execute`].
    pub fn readiness(
        &self,
        completed: &HashSet<String>,
        failed: &HashSet<String>,
        policy: ConditionPolicy,
    ) -> Readiness {
        let unresolved = self
            .dependencies
            .iter()
            .any(|d| !completed.contains(d) && !failed.contains(d));
        if unresolved {
            return Readiness::Waiting;
        }
        let any_failed = self.dependencies.iter().any(|d| failed.contains(d));

        match &self.condition {
            Condition::Always => Readiness::Ready,
            Condition::OnSuccess if any_failed => {
                Readiness::Skip("a dependency failed".to_string())
            }
            Condition::OnSuccess => Readiness::Ready,
            Condition::OnFailure if any_failed => Readiness::Ready,
            Condition::OnFailure => Readiness::Skip("no dependency failed".to_string()),
            Condition::Custom(src) => match self.condition.parse_custom() {
                Ok(Some(expr)) => match expr.evaluate(completed, failed) {
                    Some(true) => Readiness::Ready,
                    Some(false) => Readiness::Skip(format!("condition '{src}' is false")),
                    None => Readiness::Waiting,
                },
                Ok(None) => Readiness::Ready,
                Err(e) => match policy {
                    ConditionPolicy::FailOpen => {
                        warn!(step_id = %self.id, condition = %src, error = %e, "Unparseable condition, running step anyway");
                        Readiness::Ready
                    }
                    ConditionPolicy::FailClosed => {
                        Readiness::Skip(format!("malformed condition '{src}': {e}"))
                    }
                },
            },
        }
    }
}

/// Scheduling decision for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// May start now.
    Ready,
    /// Some dependency or referenced step is unresolved.
    Waiting,
    /// Will never run; the reason is recorded on the result.
    Skip(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Plan
// ─────────────────────────────────────────────────────────────────────────────

/// A graph of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan id.
    pub id: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Plan {
    /// Create an empty plan.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            steps: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Step ids in declaration order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Ids listed as another step's fallback. These only run when their
    /// primary fails.
    pub fn fallback_ids(&self) -> HashSet<&str> {
        self.steps
            .iter()
            .flat_map(|s| {
                s.fallbacks
                    .iter()
                    .filter(move |f| **f != s.id)
                    .map(|f| f.as_str())
            })
            .collect()
    }

    /// Structural problems: empty plan, empty or duplicate ids, dangling
    /// dependencies or fallbacks, self-fallbacks and dependency cycles.
    pub fn structural_issues(&self) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        if self.steps.is_empty() {
            issues.push(PlanIssue::EmptyPlan);
            return issues;
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                issues.push(PlanIssue::EmptyStepId);
            } else if !ids.insert(step.id.as_str()) {
                issues.push(PlanIssue::DuplicateStep {
                    step: step.id.clone(),
                });
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    issues.push(PlanIssue::DanglingDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for fallback in &step.fallbacks {
                if *fallback == step.id {
                    issues.push(PlanIssue::SelfFallback {
                        step: step.id.clone(),
                    });
                } else if !ids.contains(fallback.as_str()) {
                    issues.push(PlanIssue::DanglingFallback {
                        step: step.id.clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            issues.push(PlanIssue::CyclicPlan { cycle });
        }
        issues
    }

    /// Find one dependency cycle, returned as a closed path
    /// (`[a, b, a]` means `a` depends on `b` which depends on `a`).
    ///
    /// Unknown dependencies are ignored. Uses Kahn's algorithm to strip
    /// every step that is not on or behind a cycle, then walks the
    /// remaining dependency edges until a step repeats.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let n = self.steps.len();

        let deps: Vec<Vec<usize>> = self
            .steps
            .iter()
            .map(|s| {
                s.dependencies
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();

        let mut in_degree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut removed = vec![false; n];
        while let Some(node) = queue.pop() {
            removed[node] = true;
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        // Every remaining step has at least one remaining dependency.
        let start = (0..n).find(|&i| !removed[i])?;
        let mut path = vec![start];
        let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let next = *deps[current].iter().find(|&&d| !removed[d])?;
            if let Some(&at) = position.get(&next) {
                let mut cycle: Vec<String> = path[at..]
                    .iter()
                    .map(|&i| self.steps[i].id.clone())
                    .collect();
                cycle.push(self.steps[next].id.clone());
                return Some(cycle);
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }

    /// Partition steps into levels: level 0 has no dependencies, level `n`
    /// depends only on earlier levels. Within a level, steps keep
    /// declaration order.
    ///
    /// Informative only; the engine schedules incrementally.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>> {
        let structural = self.structural_issues();
        if !structural.is_empty() {
            return Err(PlanError::Structural(structural));
        }

        let mut placed: HashSet<&str> = HashSet::new();
        let mut levels = Vec::new();
        while placed.len() < self.steps.len() {
            let level: Vec<&str> = self
                .steps
                .iter()
                .filter(|s| !placed.contains(s.id.as_str()))
                .filter(|s| s.dependencies.iter().all(|d| placed.contains(d.as_str())))
                .map(|s| s.id.as_str())
                .collect();
            if level.is_empty() {
                // Unreachable after the cycle check above.
                break;
            }
            placed.extend(level.iter().copied());
            levels.push(level.into_iter().map(String::from).collect());
        }
        Ok(levels)
    }

    /// Transitive dependencies of `step_id`.
    pub fn ancestors(&self, step_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![step_id];
        while let Some(id) = stack.pop() {
            if let Some(step) = self.step(id) {
                for dep in &step.dependencies {
                    if seen.insert(dep.clone()) {
                        stack.push(dep);
                    }
                }
            }
        }
        seen
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plan files
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level wrapper matching the file structure `[plan]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub plan: Plan,
}

impl PlanFile {
    /// Parse a plan from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Parse a plan from JSON. Accepts both `{"plan": {...}}` and a bare
    /// plan object.
    pub fn from_json(json_str: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json_str)?;
        if value.get("plan").is_some_and(Value::is_object) {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(PlanFile {
                plan: serde_json::from_value(value)?,
            })
        }
    }

    /// Load a plan file, choosing the format by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(PlanError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn into_plan(self) -> Plan {
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn example_plan() -> Plan {
        Plan::new("example")
            .with_step(Step::new("fetch", "web_fetch"))
            .with_step(Step::new("parse", "parse").depends_on("fetch"))
            .with_step(Step::new("summarize", "summarize").depends_on("parse"))
            .with_step(
                Step::new("audit", "audit")
                    .depends_on("fetch")
                    .condition(Condition::Always),
            )
    }

    #[test]
    fn test_execution_levels_example() {
        let levels = example_plan().execution_levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["fetch".to_string()],
                vec!["parse".to_string(), "audit".to_string()],
                vec!["summarize".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_detected_and_reported() {
        let plan = Plan::new("cyclic")
            .with_step(Step::new("root", "x"))
            .with_step(Step::new("a", "x").depends_on("root").depends_on("c"))
            .with_step(Step::new("b", "x").depends_on("a"))
            .with_step(Step::new("c", "x").depends_on("b"))
            .with_step(Step::new("d", "x").depends_on("c"));

        let cycle = plan.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        let members: HashSet<&str> = cycle.iter().map(|s| s.as_str()).collect();
        assert_eq!(members, HashSet::from(["a", "b", "c"]));

        let issues = plan.structural_issues();
        assert!(matches!(issues.as_slice(), [PlanIssue::CyclicPlan { .. }]));
        assert!(matches!(
            plan.execution_levels(),
            Err(PlanError::Structural(_))
        ));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let plan = Plan::new("p").with_step(Step::new("a", "x").depends_on("a"));
        assert_eq!(
            plan.find_cycle(),
            Some(vec!["a".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_dangling_references_named() {
        let plan = Plan::new("p")
            .with_step(Step::new("a", "x").depends_on("ghost"))
            .with_step(Step::new("b", "x").fallback("phantom").fallback("b"));
        let issues = plan.structural_issues();
        assert!(issues.contains(&PlanIssue::DanglingDependency {
            step: "a".into(),
            dependency: "ghost".into()
        }));
        assert!(issues.contains(&PlanIssue::DanglingFallback {
            step: "b".into(),
            fallback: "phantom".into()
        }));
        assert!(issues.contains(&PlanIssue::SelfFallback { step: "b".into() }));
        let msg = plan.execution_levels().unwrap_err().to_string();
        assert!(msg.contains("ghost"));
        assert!(msg.contains("phantom"));
    }

    #[test]
    fn test_duplicate_and_empty() {
        let plan = Plan::new("p")
            .with_step(Step::new("a", "x"))
            .with_step(Step::new("a", "y"));
        assert_eq!(
            plan.structural_issues(),
            vec![PlanIssue::DuplicateStep { step: "a".into() }]
        );
        assert_eq!(
            Plan::new("empty").structural_issues(),
            vec![PlanIssue::EmptyPlan]
        );
    }

    #[test]
    fn test_on_success_and_on_failure() {
        let b = Step::new("b", "x")
            .depends_on("a")
            .condition(Condition::OnSuccess);
        let c = Step::new("c", "x")
            .depends_on("a")
            .condition(Condition::OnFailure);
        let policy = ConditionPolicy::FailClosed;

        // a failed
        assert!(!b.can_execute(&ids(&[]), &ids(&["a"]), policy));
        assert!(c.can_execute(&ids(&[]), &ids(&["a"]), policy));
        // a succeeded
        assert!(b.can_execute(&ids(&["a"]), &ids(&[]), policy));
        assert!(!c.can_execute(&ids(&["a"]), &ids(&[]), policy));
        // a unresolved
        assert_eq!(b.readiness(&ids(&[]), &ids(&[]), policy), Readiness::Waiting);
    }

    #[test]
    fn test_always_runs_after_failure() {
        let s = Step::new("s", "x")
            .depends_on("a")
            .depends_on("b")
            .condition(Condition::Always);
        let policy = ConditionPolicy::FailClosed;
        assert!(!s.can_execute(&ids(&["a"]), &ids(&[]), policy));
        assert!(s.can_execute(&ids(&["a"]), &ids(&["b"]), policy));
    }

    #[test]
    fn test_custom_condition_readiness() {
        let s = Step::new("s", "x")
            .depends_on("a")
            .condition(Condition::Custom("a.failed or b.success".into()));
        let policy = ConditionPolicy::FailClosed;
        assert_eq!(
            s.readiness(&ids(&["a"]), &ids(&[]), policy),
            Readiness::Waiting
        );
        assert_eq!(
            s.readiness(&ids(&[]), &ids(&["a"]), policy),
            Readiness::Ready
        );
        assert!(matches!(
            s.readiness(&ids(&["a"]), &ids(&["b"]), policy),
            Readiness::Skip(_)
        ));
    }

    #[test]
    fn test_malformed_condition_policy() {
        let s = Step::new("s", "x").condition(Condition::Custom("a.success +".into()));
        assert!(!s.can_execute(&ids(&[]), &ids(&[]), ConditionPolicy::FailClosed));
        assert!(s.can_execute(&ids(&[]), &ids(&[]), ConditionPolicy::FailOpen));
    }

    #[test]
    fn test_fallback_ids_and_ancestors() {
        let plan = Plan::new("p")
            .with_step(Step::new("a", "x").fallback("a_alt"))
            .with_step(Step::new("a_alt", "y"))
            .with_step(Step::new("b", "x").depends_on("a"))
            .with_step(Step::new("c", "x").depends_on("b"));
        assert_eq!(plan.fallback_ids(), HashSet::from(["a_alt"]));
        assert_eq!(plan.ancestors("c"), ids(&["a", "b"]));
        assert!(plan.ancestors("a").is_empty());
    }

    #[test]
    fn test_timeout_duration() {
        let s = Step::new("s", "x").timeout(Duration::from_millis(100));
        assert_eq!(s.timeout_duration(), Some(Duration::from_millis(100)));
        let mut s = Step::new("s", "x");
        s.timeout_secs = Some(0.0);
        assert!(s.timeout_duration().is_none());
        s.timeout_secs = Some(1e30);
        assert!(s.timeout_duration().is_none());
        s.timeout_secs = Some(f64::NAN);
        assert!(s.timeout_duration().is_none());
    }

    #[test]
    fn test_parse_toml_plan() {
        let toml = r#"
[plan]
id = "digest"

[[plan.steps]]
id = "fetch"
capability = "web_fetch"
parameters = { url = "@url" }
timeout_secs = 2.5
fallbacks = ["cached"]

[[plan.steps]]
id = "cached"
capability = "cache_lookup"

[[plan.steps]]
id = "summarize"
capability = "summarize"
params = { text = "$fetch.body" }
depends_on = ["fetch"]
condition = { custom = "fetch.success" }
"#;
        let plan = PlanFile::from_toml(toml).unwrap().into_plan();
        assert_eq!(plan.steps.len(), 3);
        let fetch = plan.step("fetch").unwrap();
        assert_eq!(fetch.parameters["url"], json!("@url"));
        assert_eq!(fetch.condition, Condition::OnSuccess);
        assert_eq!(fetch.timeout_duration(), Some(Duration::from_millis(2500)));
        let summarize = plan.step("summarize").unwrap();
        assert_eq!(summarize.dependencies, vec!["fetch"]);
        assert_eq!(
            summarize.condition,
            Condition::Custom("fetch.success".into())
        );
    }

    #[test]
    fn test_parse_json_plan_bare_and_wrapped() {
        let bare = r#"{"id": "p", "steps": [{"id": "a", "capability": "echo", "parameters": {"n": 1}}]}"#;
        let plan = PlanFile::from_json(bare).unwrap().into_plan();
        assert_eq!(plan.steps[0].parameters["n"], json!(1));

        let wrapped = format!(r#"{{"plan": {bare}}}"#);
        assert_eq!(PlanFile::from_json(&wrapped).unwrap().into_plan(), plan);
        assert!(PlanFile::from_json("[1, 2]").is_err());
    }
}
