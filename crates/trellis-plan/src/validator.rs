//! Plan validation against a capability registry.

use std::collections::HashSet;

use tracing::debug;

use trellis_registry::{CapabilityDescriptor, CapabilityRegistry, validate_params};

use crate::condition::{Condition, Expr};
use crate::plan::{Plan, Step};
use crate::reference::collect_references;
use crate::report::{PlanIssue, ValidationReport};

/// Confidence lost per error.
const ERROR_PENALTY: f64 = 0.2;
/// Confidence lost per warning.
const WARNING_PENALTY: f64 = 0.1;

/// Checks a plan before execution.
///
/// Structural issues are always errors. Capability, parameter, reference
/// and condition findings are errors or warnings depending on whether the
/// step could still run.
pub struct PlanValidator<'a> {
    registry: &'a CapabilityRegistry,
}

impl<'a> PlanValidator<'a> {
    pub fn new(registry: &'a CapabilityRegistry) -> Self {
        Self { registry }
    }

    /// Validate `plan` and compute its confidence.
    pub fn validate(&self, plan: &Plan) -> ValidationReport {
        let mut errors = plan.structural_issues();
        let mut warnings = Vec::new();

        let ids: HashSet<&str> = plan.step_ids().into_iter().collect();
        let fallback_ids = plan.fallback_ids();
        let mut reliabilities = Vec::new();

        for step in &plan.steps {
            match self.registry.lookup(&step.capability) {
                Ok(descriptor) => {
                    reliabilities.push(descriptor.reliability.weight());
                    check_parameters(step, descriptor, &mut errors, &mut warnings);
                }
                Err(_) => errors.push(PlanIssue::UnknownCapability {
                    step: step.id.clone(),
                    capability: step.capability.clone(),
                }),
            }
            check_references(plan, step, &ids, &mut errors, &mut warnings);
            check_condition(step, &ids, &mut errors, &mut warnings);
            check_fallback_dependencies(step, &fallback_ids, &mut warnings);
        }

        let confidence = plan_confidence(errors.len(), warnings.len(), &reliabilities);
        debug!(
            plan_id = %plan.id,
            errors = errors.len(),
            warnings = warnings.len(),
            confidence,
            "Validated plan"
        );

        ValidationReport {
            errors,
            warnings,
            confidence,
        }
    }
}

/// Validate `plan` against `registry`.
pub fn validate_plan(plan: &Plan, registry: &CapabilityRegistry) -> ValidationReport {
    PlanValidator::new(registry).validate(plan)
}

fn check_parameters(
    step: &Step,
    descriptor: &CapabilityDescriptor,
    errors: &mut Vec<PlanIssue>,
    warnings: &mut Vec<PlanIssue>,
) {
    let outcome = validate_params(descriptor, &step.parameters);

    for issue in outcome.errors {
        // A reference is only typed once it resolves at run time.
        let deferred = step
            .parameters
            .get(&issue.parameter)
            .is_some_and(|v| !collect_references(v).is_empty());
        let finding = PlanIssue::Parameter {
            step: step.id.clone(),
            parameter: issue.parameter,
            message: issue.message,
        };
        if deferred {
            warnings.push(finding);
        } else {
            errors.push(finding);
        }
    }
    for issue in outcome.warnings {
        warnings.push(PlanIssue::Parameter {
            step: step.id.clone(),
            parameter: issue.parameter,
            message: issue.message,
        });
    }
}

fn check_references(
    plan: &Plan,
    step: &Step,
    ids: &HashSet<&str>,
    errors: &mut Vec<PlanIssue>,
    warnings: &mut Vec<PlanIssue>,
) {
    let mut upstream: Option<HashSet<String>> = None;
    for (name, value) in &step.parameters {
        for reference in collect_references(value) {
            let Some(target) = reference.step_id() else {
                continue;
            };
            if !ids.contains(target) {
                errors.push(PlanIssue::UnknownReference {
                    step: step.id.clone(),
                    parameter: name.clone(),
                    referenced: target.to_string(),
                });
                continue;
            }
            let ancestors = upstream.get_or_insert_with(|| plan.ancestors(&step.id));
            if !ancestors.contains(target) {
                warnings.push(PlanIssue::ReferenceNotUpstream {
                    step: step.id.clone(),
                    parameter: name.clone(),
                    referenced: target.to_string(),
                });
            }
        }
    }
}

fn check_condition(
    step: &Step,
    ids: &HashSet<&str>,
    errors: &mut Vec<PlanIssue>,
    warnings: &mut Vec<PlanIssue>,
) {
    let Condition::Custom(src) = &step.condition else {
        return;
    };
    let expr = match Expr::parse(src) {
        Ok(expr) => expr,
        Err(e) => {
            errors.push(PlanIssue::MalformedCondition {
                step: step.id.clone(),
                expression: src.clone(),
                reason: e.to_string(),
            });
            return;
        }
    };

    for referenced in expr.referenced_steps() {
        if !ids.contains(referenced) {
            errors.push(PlanIssue::UnknownConditionStep {
                step: step.id.clone(),
                referenced: referenced.to_string(),
            });
        } else if !step.dependencies.iter().any(|d| d == referenced) {
            warnings.push(PlanIssue::ConditionNotDependency {
                step: step.id.clone(),
                referenced: referenced.to_string(),
            });
        }
    }
}

/// A step gated on a fallback-only step runs only if that fallback was
/// attempted; otherwise it is skipped.
fn check_fallback_dependencies(
    step: &Step,
    fallback_ids: &HashSet<&str>,
    warnings: &mut Vec<PlanIssue>,
) {
    if fallback_ids.contains(step.id.as_str()) {
        return;
    }
    let expr = match &step.condition {
        Condition::Custom(src) => Expr::parse(src).ok(),
        _ => None,
    };
    let mut waits_on: Vec<&str> = step.dependencies.iter().map(String::as_str).collect();
    if let Some(expr) = &expr {
        waits_on.extend(expr.referenced_steps());
    }

    let mut seen = HashSet::new();
    for target in waits_on {
        if fallback_ids.contains(target) && seen.insert(target) {
            warnings.push(PlanIssue::DependsOnFallback {
                step: step.id.clone(),
                fallback: target.to_string(),
            });
        }
    }
}

/// `1 - 0.2 * errors - 0.1 * warnings`, averaged with the mean reliability
/// of known capabilities and clamped to `[0, 1]`.
pub fn plan_confidence(errors: usize, warnings: usize, reliabilities: &[f64]) -> f64 {
    let base = 1.0 - ERROR_PENALTY * errors as f64 - WARNING_PENALTY * warnings as f64;
    let score = if reliabilities.is_empty() {
        base
    } else {
        let mean = reliabilities.iter().sum::<f64>() / reliabilities.len() as f64;
        (base + mean) / 2.0
    };
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_registry::{
        InvocationContext, ParamType, ParameterSpec, Params, Registration, Reliability,
        capability_fn,
    };

    fn noop() -> impl trellis_registry::Capability + 'static {
        capability_fn(|_params: Params, _ctx: InvocationContext| async { Ok(json!(null)) })
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                Registration::new("fetch", noop())
                    .reliability(Reliability::High)
                    .parameter(ParameterSpec::required("url", ParamType::String)),
            )
            .unwrap();
        registry
            .register(
                Registration::new("parse", noop())
                    .reliability(Reliability::Medium)
                    .parameter(ParameterSpec::required("text", ParamType::String)),
            )
            .unwrap();
        registry
            .register(Registration::new("audit", noop()).reliability(Reliability::Low))
            .unwrap();
        registry
    }

    #[test]
    fn test_valid_plan_confidence() {
        let plan = Plan::new("p")
            .with_step(Step::new("fetch", "fetch").param("url", "https://example.com"))
            .with_step(
                Step::new("parse", "parse")
                    .param("text", "$fetch.body")
                    .depends_on("fetch"),
            );
        let report = validate_plan(&plan, &registry());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        // (1.0 + (0.95 + 0.80) / 2) / 2
        assert!((report.confidence - 0.9375).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_capability_and_missing_param() {
        let plan = Plan::new("p")
            .with_step(Step::new("a", "teleport"))
            .with_step(Step::new("b", "fetch"));
        let report = validate_plan(&plan, &registry());
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(
            &report.errors[0],
            PlanIssue::UnknownCapability { capability, .. } if capability == "teleport"
        ));
        assert!(matches!(
            &report.errors[1],
            PlanIssue::Parameter { parameter, .. } if parameter == "url"
        ));
        assert!(!report.has_structural_errors());
        // base 0.6 averaged with the single known reliability 0.95
        assert!((report.confidence - 0.775).abs() < 1e-9);
    }

    #[test]
    fn test_reference_typed_param_is_warning() {
        let plan = Plan::new("p")
            .with_step(Step::new("fetch", "fetch").param("url", "@url"))
            .with_step(
                Step::new("fetch2", "fetch")
                    .param("url", json!(["$fetch.links"]))
                    .depends_on("fetch"),
            );
        let report = validate_plan(&plan, &registry());
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
        assert!(matches!(
            &report.warnings[0],
            PlanIssue::Parameter { step, .. } if step == "fetch2"
        ));
    }

    #[test]
    fn test_reference_checks() {
        let plan = Plan::new("p")
            .with_step(Step::new("fetch", "fetch").param("url", "x"))
            .with_step(Step::new("other", "fetch").param("url", "y"))
            .with_step(
                Step::new("parse", "parse")
                    .param("text", "$ghost.body")
                    .param("extra", "$other")
                    .depends_on("fetch"),
            );
        let report = validate_plan(&plan, &registry());
        assert!(report.errors.contains(&PlanIssue::UnknownReference {
            step: "parse".into(),
            parameter: "text".into(),
            referenced: "ghost".into(),
        }));
        assert!(report.warnings.contains(&PlanIssue::ReferenceNotUpstream {
            step: "parse".into(),
            parameter: "extra".into(),
            referenced: "other".into(),
        }));
    }

    #[test]
    fn test_condition_checks() {
        let plan = Plan::new("p")
            .with_step(Step::new("fetch", "fetch").param("url", "x"))
            .with_step(Step::new("side", "audit"))
            .with_step(
                Step::new("a", "audit")
                    .depends_on("fetch")
                    .condition(Condition::Custom("fetch.failed or side.success".into())),
            )
            .with_step(Step::new("b", "audit").condition(Condition::Custom("nope.success".into())))
            .with_step(Step::new("c", "audit").condition(Condition::Custom("fetch.success +".into())));
        let report = validate_plan(&plan, &registry());
        assert!(report.warnings.contains(&PlanIssue::ConditionNotDependency {
            step: "a".into(),
            referenced: "side".into(),
        }));
        assert!(report.errors.contains(&PlanIssue::UnknownConditionStep {
            step: "b".into(),
            referenced: "nope".into(),
        }));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, PlanIssue::MalformedCondition { step, .. } if step == "c")));
    }

    #[test]
    fn test_waiting_on_fallback_step_is_warning() {
        let plan = Plan::new("p")
            .with_step(Step::new("fetch", "fetch").param("url", "x").fallback("mirror"))
            .with_step(Step::new("mirror", "fetch").param("url", "y"))
            .with_step(
                Step::new("parse", "parse")
                    .param("text", "$mirror.body")
                    .depends_on("mirror")
                    .condition(Condition::Custom("mirror.success".into())),
            )
            .with_step(
                Step::new("log", "audit")
                    .condition(Condition::Custom("mirror.failed".into())),
            );
        let report = validate_plan(&plan, &registry());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(!report.has_structural_errors());

        let flagged: Vec<(&str, &str)> = report
            .warnings
            .iter()
            .filter_map(|w| match w {
                PlanIssue::DependsOnFallback { step, fallback } => {
                    Some((step.as_str(), fallback.as_str()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(flagged, vec![("parse", "mirror"), ("log", "mirror")]);
    }

    #[test]
    fn test_structural_errors_reported() {
        let plan = Plan::new("p")
            .with_step(Step::new("a", "audit").depends_on("b"))
            .with_step(Step::new("b", "audit").depends_on("a"));
        let report = validate_plan(&plan, &registry());
        assert!(!report.is_valid());
        assert!(report.has_structural_errors());
        let msg = report.errors[0].to_string();
        assert!(msg.starts_with("dependency cycle: "));
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(plan_confidence(10, 0, &[]), 0.0);
        assert_eq!(plan_confidence(0, 0, &[]), 1.0);
        assert!((plan_confidence(0, 1, &[0.4]) - 0.65).abs() < 1e-9);
    }
}
