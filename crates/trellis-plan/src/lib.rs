//! Plan contract for trellis.
//!
//! A plan is a graph of [`Step`]s, each bound to a capability, with
//! dependencies, a [`Condition`], an optional timeout and an ordered list of
//! fallbacks. This crate provides:
//!
//! - Plan types and TOML/JSON loading ([`PlanFile`])
//! - Readiness rules ([`Step::can_execute`])
//! - Parameter [`Reference`] parsing (`$step.field`, `@key`)
//! - The CUSTOM condition grammar ([`Expr`])
//! - Pre-execution validation ([`PlanValidator`]) and level partitioning
//!   ([`Plan::execution_levels`])

mod condition;
mod error;
mod plan;
mod reference;
mod report;
mod validator;

pub use condition::{Condition, ConditionError, Expr};
pub use error::{PlanError, Result};
pub use plan::{Plan, PlanFile, Readiness, Step};
pub use reference::{Reference, ReferenceKind, Segment, collect_references, navigate};
pub use report::{PlanIssue, ValidationReport};
pub use validator::{PlanValidator, plan_confidence, validate_plan};
