//! Capability registry.
//!
//! Holds the descriptor and handler for every capability. Registration
//! happens up front (or dynamically before first use); after that the
//! registry is shared read-only behind an `Arc` by any number of runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use trellis_config::{DuplicatePolicy, RegistrySection};

use crate::capability::{Capability, Params};
use crate::error::{RegistryError, Result};
use crate::schema::{ParamType, ParameterSpec, Reliability, parameters_from_schema, value_type_name};

/// Maximum number of alternatives returned by `suggest_alternatives`.
pub const MAX_ALTERNATIVES: usize = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable metadata describing a registered capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Category tag used for alternatives.
    pub category: String,
    /// Reliability class.
    pub reliability: Reliability,
    /// Declared parameters.
    pub parameters: Vec<ParameterSpec>,
    /// Declared result type.
    pub result_type: ParamType,
    /// Rough expected duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    /// Whether invocation may suspend (perform I/O).
    pub suspends: bool,
}

impl CapabilityDescriptor {
    /// Look up a declared parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// A descriptor together with its handler.
#[derive(Clone)]
pub struct RegisteredCapability {
    /// Metadata.
    pub descriptor: CapabilityDescriptor,
    /// Implementation.
    pub handler: Arc<dyn Capability>,
}

impl std::fmt::Debug for RegisteredCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCapability")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

/// Builder describing one capability registration.
///
/// Parameter specs are synthesized from the handler's JSON Schema (if any);
/// specs added with [`Registration::parameter`] replace synthesized ones with
/// the same name.
pub struct Registration {
    name: String,
    handler: Arc<dyn Capability>,
    description: String,
    category: String,
    reliability: Reliability,
    overrides: Vec<ParameterSpec>,
    result_type: ParamType,
    estimated_duration: Option<Duration>,
    suspends: bool,
}

impl Registration {
    /// Start a registration for `handler` under `name`.
    pub fn new(name: impl Into<String>, handler: impl Capability + 'static) -> Self {
        Self::from_arc(name, Arc::new(handler))
    }

    /// Start a registration from a shared handler.
    pub fn from_arc(name: impl Into<String>, handler: Arc<dyn Capability>) -> Self {
        Self {
            name: name.into(),
            handler,
            description: String::new(),
            category: "general".to_string(),
            reliability: Reliability::default(),
            overrides: Vec::new(),
            result_type: ParamType::Any,
            estimated_duration: None,
            suspends: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Declare or override a parameter.
    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.overrides.push(spec);
        self
    }

    pub fn result_type(mut self, result_type: ParamType) -> Self {
        self.result_type = result_type;
        self
    }

    pub fn estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }

    /// Mark whether invocation may suspend. Defaults to true.
    pub fn suspends(mut self, suspends: bool) -> Self {
        self.suspends = suspends;
        self
    }

    fn into_registered(self) -> Result<RegisteredCapability> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                name: self.name,
                reason: "name cannot be empty".into(),
            });
        }

        let mut parameters = self
            .handler
            .schema()
            .map(|schema| parameters_from_schema(&schema))
            .unwrap_or_default();
        for spec in self.overrides {
            match parameters.iter_mut().find(|p| p.name == spec.name) {
                Some(existing) => *existing = spec,
                None => parameters.push(spec),
            }
        }

        let mut seen = std::collections::HashSet::new();
        for p in &parameters {
            if !seen.insert(p.name.as_str()) {
                return Err(RegistryError::InvalidRegistration {
                    name: self.name.clone(),
                    reason: format!("parameter '{}' declared twice", p.name),
                });
            }
        }

        Ok(RegisteredCapability {
            descriptor: CapabilityDescriptor {
                name: self.name,
                description: self.description,
                category: self.category,
                reliability: self.reliability,
                parameters,
                result_type: self.result_type,
                estimated_duration_ms: self.estimated_duration.map(|d| d.as_millis() as u64),
                suspends: self.suspends,
            },
            handler: self.handler,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation Output
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of a parameter problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A required parameter is absent.
    Missing,
    /// A parameter has the wrong JSON type.
    TypeMismatch,
    /// A parameter violates a validation rule.
    RuleViolation,
    /// A parameter is not declared by the capability.
    Unknown,
}

/// One parameter problem found during validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterIssue {
    /// Parameter name.
    pub parameter: String,
    /// What went wrong.
    pub kind: IssueKind,
    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for ParameterIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of validating a parameter map against a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamValidation {
    /// Hard errors.
    pub errors: Vec<ParameterIssue>,
    /// Non-fatal findings (unknown extra parameters).
    pub warnings: Vec<ParameterIssue>,
}

impl ParamValidation {
    /// True when there are no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Error messages joined for display.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A candidate returned by `find_candidates`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    /// Capability name.
    pub name: String,
    /// Relevance score (higher is better).
    pub score: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of available capabilities.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    entries: HashMap<String, RegisteredCapability>,
    policy: DuplicatePolicy,
}

impl CapabilityRegistry {
    /// Create an empty registry that rejects conflicting duplicates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with the given duplicate policy.
    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
        }
    }

    /// Create an empty registry from configuration.
    pub fn from_config(config: &RegistrySection) -> Self {
        Self::with_policy(config.duplicate_policy)
    }

    /// Active duplicate policy.
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Register a capability.
    ///
    /// Re-registering a name with identical metadata is a no-op. With
    /// conflicting metadata the outcome depends on the duplicate policy:
    /// `Reject` fails with [`RegistryError::DuplicateCapability`], `Overwrite`
    /// replaces the entry and logs a warning.
    pub fn register(&mut self, registration: Registration) -> Result<()> {
        let registered = registration.into_registered()?;
        let name = registered.descriptor.name.clone();

        if let Some(existing) = self.entries.get(&name) {
            if existing.descriptor == registered.descriptor {
                debug!(capability = %name, "Identical re-registration ignored");
                return Ok(());
            }
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(RegistryError::DuplicateCapability(name));
                }
                DuplicatePolicy::Overwrite => {
                    warn!(capability = %name, "Overwriting previously registered capability");
                }
            }
        }

        debug!(
            capability = %name,
            category = %registered.descriptor.category,
            parameters = registered.descriptor.parameters.len(),
            "Capability registered"
        );
        self.entries.insert(name, registered);
        Ok(())
    }

    /// Look up a descriptor by name.
    pub fn lookup(&self, name: &str) -> Result<&CapabilityDescriptor> {
        self.entries
            .get(name)
            .map(|e| &e.descriptor)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Get the descriptor and handler by name.
    pub fn get(&self, name: &str) -> Option<RegisteredCapability> {
        self.entries.get(name).cloned()
    }

    /// Check if a capability exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All capability names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<&CapabilityDescriptor> {
        let mut all: Vec<&CapabilityDescriptor> =
            self.entries.values().map(|e| &e.descriptor).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Names of capabilities in a category, sorted.
    pub fn by_category(&self, category: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .values()
            .filter(|e| e.descriptor.category == category)
            .map(|e| e.descriptor.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Get the number of registered capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate a parameter map against a capability's declared schema.
    ///
    /// Missing required parameters, type mismatches and rule violations are
    /// errors. Parameters the capability does not declare are warnings.
    pub fn validate(&self, name: &str, params: &Params) -> Result<ParamValidation> {
        let descriptor = self.lookup(name)?;
        Ok(validate_params(descriptor, params))
    }

    /// Up to three other capabilities sharing the failed one's category.
    ///
    /// Ordered by reliability (most reliable first), then name.
    pub fn suggest_alternatives(&self, failed_name: &str) -> Vec<String> {
        let Some(failed) = self.entries.get(failed_name) else {
            return Vec::new();
        };
        let category = &failed.descriptor.category;

        let mut peers: Vec<&CapabilityDescriptor> = self
            .entries
            .values()
            .map(|e| &e.descriptor)
            .filter(|d| d.name != failed_name && &d.category == category)
            .collect();
        peers.sort_by(|a, b| {
            b.reliability
                .weight()
                .total_cmp(&a.reliability.weight())
                .then_with(|| a.name.cmp(&b.name))
        });
        peers
            .into_iter()
            .take(MAX_ALTERNATIVES)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Rank capabilities by term overlap with free text.
    ///
    /// A query term scores 3 when it matches a name token, 2 when it matches
    /// the category and 1 when it appears in the description. Only
    /// capabilities with a positive score are returned.
    pub fn find_candidates(&self, text: &str, limit: usize) -> Vec<Candidate> {
        let terms = tokenize(text);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut ranked: Vec<Candidate> = self
            .entries
            .values()
            .map(|e| {
                let d = &e.descriptor;
                let name_tokens = tokenize(&d.name);
                let category = d.category.to_lowercase();
                let description_tokens = tokenize(&d.description);

                let score = terms
                    .iter()
                    .map(|term| {
                        let mut s = 0;
                        if name_tokens.contains(term) {
                            s += 3;
                        }
                        if &category == term {
                            s += 2;
                        }
                        if description_tokens.contains(term) {
                            s += 1;
                        }
                        s
                    })
                    .sum();
                Candidate {
                    name: d.name.clone(),
                    score,
                }
            })
            .filter(|c| c.score > 0)
            .collect();

        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        ranked.truncate(limit);
        ranked
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Validate `params` against a descriptor.
pub fn validate_params(descriptor: &CapabilityDescriptor, params: &Params) -> ParamValidation {
    let mut outcome = ParamValidation::default();

    for spec in &descriptor.parameters {
        match params.get(&spec.name) {
            None => {
                if spec.required {
                    outcome.errors.push(ParameterIssue {
                        parameter: spec.name.clone(),
                        kind: IssueKind::Missing,
                        message: format!("missing required parameter '{}'", spec.name),
                    });
                }
            }
            Some(value) => {
                if !spec.param_type.accepts(value) {
                    outcome.errors.push(ParameterIssue {
                        parameter: spec.name.clone(),
                        kind: IssueKind::TypeMismatch,
                        message: format!(
                            "invalid type for '{}': expected {}, got {}",
                            spec.name,
                            spec.param_type.as_str(),
                            value_type_name(value)
                        ),
                    });
                    continue;
                }
                for rule in &spec.rules {
                    if let Err(reason) = rule.check(value) {
                        outcome.errors.push(ParameterIssue {
                            parameter: spec.name.clone(),
                            kind: IssueKind::RuleViolation,
                            message: format!("'{}' {}", spec.name, reason),
                        });
                    }
                }
            }
        }
    }

    for name in params.keys() {
        if descriptor.parameter(name).is_none() {
            outcome.warnings.push(ParameterIssue {
                parameter: name.clone(),
                kind: IssueKind::Unknown,
                message: format!(
                    "unknown parameter '{}' for capability '{}'",
                    name, descriptor.name
                ),
            });
        }
    }

    outcome
}

/// Fill in declared defaults for parameters the caller omitted.
pub fn apply_defaults(descriptor: &CapabilityDescriptor, params: &mut Params) {
    for spec in &descriptor.parameters {
        if let Some(ref default) = spec.default
            && !params.contains_key(&spec.name)
        {
            params.insert(spec.name.clone(), default.clone());
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityResult, InvocationContext, capability_fn};
    use crate::schema::ValidationRule;
    use serde_json::{Value, json};

    fn noop() -> impl Capability + 'static {
        capability_fn(|_p: Params, _c: InvocationContext| async move {
            CapabilityResult::Ok(Value::Null)
        })
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    fn sample_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                Registration::new("web_fetch", noop())
                    .description("Fetch a web page over HTTP")
                    .category("retrieval")
                    .reliability(Reliability::Medium)
                    .parameter(
                        ParameterSpec::required("url", ParamType::String)
                            .with_rule(ValidationRule::NonEmpty),
                    ),
            )
            .unwrap();
        registry
            .register(
                Registration::new("cache_lookup", noop())
                    .description("Look up a cached page")
                    .category("retrieval")
                    .reliability(Reliability::High),
            )
            .unwrap();
        registry
            .register(
                Registration::new("archive_fetch", noop())
                    .description("Fetch a page from the web archive")
                    .category("retrieval")
                    .reliability(Reliability::Low),
            )
            .unwrap();
        registry
            .register(
                Registration::new("mirror_fetch", noop())
                    .category("retrieval")
                    .reliability(Reliability::Medium),
            )
            .unwrap();
        registry
            .register(
                Registration::new("summarize", noop())
                    .description("Summarize text")
                    .category("analysis"),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_registry_empty() {
        let registry = CapabilityRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(matches!(
            registry.lookup("nothing"),
            Err(RegistryError::NotFound(name)) if name == "nothing"
        ));
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = sample_registry();
        assert_eq!(registry.len(), 5);
        let d = registry.lookup("web_fetch").unwrap();
        assert_eq!(d.category, "retrieval");
        assert_eq!(d.parameters.len(), 1);
        assert!(d.suspends);
        assert!(registry.get("web_fetch").is_some());
        assert_eq!(
            registry.names(),
            vec![
                "archive_fetch",
                "cache_lookup",
                "mirror_fetch",
                "summarize",
                "web_fetch"
            ]
        );
        assert_eq!(registry.by_category("analysis"), vec!["summarize"]);
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = CapabilityRegistry::new();
        let err = registry.register(Registration::new("  ", noop())).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRegistration { .. }));
    }

    #[test]
    fn test_duplicate_rejected_by_default() {
        let mut registry = sample_registry();
        let err = registry
            .register(Registration::new("summarize", noop()).category("other"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateCapability(name) if name == "summarize"));
        assert_eq!(registry.lookup("summarize").unwrap().category, "analysis");
    }

    #[test]
    fn test_identical_reregistration_is_noop() {
        let mut registry = sample_registry();
        registry
            .register(
                Registration::new("summarize", noop())
                    .description("Summarize text")
                    .category("analysis"),
            )
            .unwrap();
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_duplicate_overwrite_policy() {
        let mut registry = CapabilityRegistry::with_policy(DuplicatePolicy::Overwrite);
        registry
            .register(Registration::new("x", noop()).category("a"))
            .unwrap();
        registry
            .register(Registration::new("x", noop()).category("b"))
            .unwrap();
        assert_eq!(registry.lookup("x").unwrap().category, "b");
    }

    #[test]
    fn test_schema_synthesis_with_override() {
        let cap = capability_fn(|_p: Params, _c: InvocationContext| async move {
            CapabilityResult::Ok(Value::Null)
        })
        .with_schema(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "default": 10}
            },
            "required": ["query"]
        }));

        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                Registration::new("search", cap)
                    .parameter(ParameterSpec::optional("query", ParamType::String))
                    .parameter(ParameterSpec::required("index", ParamType::String)),
            )
            .unwrap();

        let d = registry.lookup("search").unwrap();
        assert_eq!(d.parameters.len(), 3);
        assert!(!d.parameter("query").unwrap().required, "override wins");
        assert_eq!(d.parameter("limit").unwrap().default, Some(json!(10)));
        assert!(d.parameter("index").unwrap().required);
    }

    #[test]
    fn test_validate_reports_missing_and_unknown() {
        let registry = sample_registry();
        let outcome = registry
            .validate("web_fetch", &params(json!({"verbose": true})))
            .unwrap();
        assert!(!outcome.is_ok());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, IssueKind::Missing);
        assert!(outcome.errors[0].message.contains("missing required parameter 'url'"));
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, IssueKind::Unknown);
    }

    #[test]
    fn test_validate_type_and_rules() {
        let registry = sample_registry();
        let outcome = registry
            .validate("web_fetch", &params(json!({"url": 42})))
            .unwrap();
        assert_eq!(outcome.errors[0].kind, IssueKind::TypeMismatch);
        assert!(outcome.error_summary().contains("expected string, got integer"));

        let outcome = registry
            .validate("web_fetch", &params(json!({"url": ""})))
            .unwrap();
        assert_eq!(outcome.errors[0].kind, IssueKind::RuleViolation);

        let outcome = registry
            .validate("web_fetch", &params(json!({"url": "https://example.com"})))
            .unwrap();
        assert!(outcome.is_ok());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_validate_unknown_capability() {
        let registry = sample_registry();
        assert!(registry.validate("nope", &Params::new()).is_err());
    }

    #[test]
    fn test_apply_defaults() {
        let d = CapabilityDescriptor {
            name: "x".into(),
            description: String::new(),
            category: "general".into(),
            reliability: Reliability::Medium,
            parameters: vec![
                ParameterSpec::optional("n", ParamType::Integer).with_default(json!(5)),
                ParameterSpec::optional("m", ParamType::Integer).with_default(json!(6)),
            ],
            result_type: ParamType::Any,
            estimated_duration_ms: None,
            suspends: false,
        };
        let mut p = params(json!({"m": 1}));
        apply_defaults(&d, &mut p);
        assert_eq!(p["n"], json!(5));
        assert_eq!(p["m"], json!(1));
    }

    #[test]
    fn test_suggest_alternatives_same_category() {
        let registry = sample_registry();
        let alts = registry.suggest_alternatives("web_fetch");
        assert_eq!(alts, vec!["cache_lookup", "mirror_fetch", "archive_fetch"]);
        assert!(registry.suggest_alternatives("summarize").is_empty());
        assert!(registry.suggest_alternatives("unknown").is_empty());
    }

    #[test]
    fn test_find_candidates_ranked() {
        let registry = sample_registry();
        let found = registry.find_candidates("fetch the page", 10);
        let ranked: Vec<(&str, u32)> = found.iter().map(|c| (c.name.as_str(), c.score)).collect();
        assert_eq!(
            ranked,
            vec![
                ("archive_fetch", 6),
                ("web_fetch", 5),
                ("mirror_fetch", 3),
                ("cache_lookup", 1),
            ]
        );

        let found = registry.find_candidates("retrieval", 2);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.score == 2));

        assert!(registry.find_candidates("", 5).is_empty());
    }
}
