//! Parameter reference resolution.
//!
//! Resolves `$step.path` and `@key.path` strings in step parameters against
//! completed step outputs and run inputs. Objects and arrays are resolved
//! recursively; a string is only a reference when the whole string is one.

use std::collections::HashMap;

use serde_json::Value;

use trellis_plan::{Reference, ReferenceKind};
use trellis_registry::Params;

use crate::context::RunInputs;
use crate::error::StepError;

/// Resolves references against a snapshot of run state.
pub struct ParameterResolver<'a> {
    outputs: &'a HashMap<String, Value>,
    inputs: &'a RunInputs,
}

impl<'a> ParameterResolver<'a> {
    pub fn new(outputs: &'a HashMap<String, Value>, inputs: &'a RunInputs) -> Self {
        Self { outputs, inputs }
    }

    /// Resolve every parameter. The first unresolved reference fails the
    /// whole map.
    pub fn resolve_params(&self, params: &Params) -> Result<Params, StepError> {
        params
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.resolve_value(value)?)))
            .collect()
    }

    pub fn resolve_value(&self, value: &Value) -> Result<Value, StepError> {
        match value {
            Value::String(s) => match Reference::parse(s) {
                Some(reference) => self.resolve_reference(&reference),
                None => Ok(value.clone()),
            },
            Value::Object(map) => {
                let mut resolved = serde_json::Map::new();
                for (k, v) in map {
                    resolved.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(arr) => {
                let resolved: Result<Vec<Value>, _> =
                    arr.iter().map(|v| self.resolve_value(v)).collect();
                Ok(Value::Array(resolved?))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_reference(&self, reference: &Reference) -> Result<Value, StepError> {
        let unresolved = |reason: String| StepError::UnresolvedReference {
            reference: reference.to_string(),
            reason,
        };

        let root = match reference.kind {
            ReferenceKind::StepOutput => self.outputs.get(&reference.root).ok_or_else(|| {
                unresolved(format!("step '{}' has no output", reference.root))
            })?,
            ReferenceKind::Context => self.inputs.get(&reference.root).ok_or_else(|| {
                unresolved(format!("no run input named '{}'", reference.root))
            })?,
        };

        reference
            .navigate(root)
            .cloned()
            .ok_or_else(|| unresolved("path does not exist".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> (HashMap<String, Value>, RunInputs) {
        let outputs = HashMap::from([
            (
                "fetch".to_string(),
                json!({"status": 200, "body": {"items": [{"name": "a"}, {"name": "b"}]}}),
            ),
            ("count".to_string(), json!(3)),
        ]);
        let mut inputs = RunInputs {
            request: json!({"query": "rust"}),
            ..Default::default()
        };
        inputs.values.insert("doc".into(), json!({"title": "T"}));
        (outputs, inputs)
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_resolves_references_preserving_types() {
        let (outputs, inputs) = fixtures();
        let resolver = ParameterResolver::new(&outputs, &inputs);
        let resolved = resolver
            .resolve_params(&params(json!({
                "whole": "$fetch",
                "status": "$fetch.status",
                "second": "$fetch.body.items[1].name",
                "n": "$count",
                "title": "@doc.title",
                "query": "@query",
                "price": "$5.00",
                "nested": {"list": ["$count", "plain"]},
            })))
            .unwrap();

        assert_eq!(resolved["whole"]["status"], json!(200));
        assert_eq!(resolved["status"], json!(200));
        assert_eq!(resolved["second"], json!("b"));
        assert_eq!(resolved["n"], json!(3));
        assert_eq!(resolved["title"], json!("T"));
        assert_eq!(resolved["query"], json!("rust"));
        assert_eq!(resolved["price"], json!("$5.00"));
        assert_eq!(resolved["nested"], json!({"list": [3, "plain"]}));
    }

    #[test]
    fn test_missing_step_output_is_error() {
        let (outputs, inputs) = fixtures();
        let resolver = ParameterResolver::new(&outputs, &inputs);
        let err = resolver
            .resolve_params(&params(json!({"x": "$never_ran.value"})))
            .unwrap_err();
        match err {
            StepError::UnresolvedReference { reference, reason } => {
                assert_eq!(reference, "$never_ran.value");
                assert!(reason.contains("never_ran"));
            }
            other => panic!("expected UnresolvedReference, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_path_is_error_not_null() {
        let (outputs, inputs) = fixtures();
        let resolver = ParameterResolver::new(&outputs, &inputs);
        assert!(matches!(
            resolver.resolve_value(&json!("$fetch.body.missing")),
            Err(StepError::UnresolvedReference { .. })
        ));
        assert!(matches!(
            resolver.resolve_value(&json!("$fetch.body.items[9]")),
            Err(StepError::UnresolvedReference { .. })
        ));
        assert!(matches!(
            resolver.resolve_value(&json!("@absent")),
            Err(StepError::UnresolvedReference { .. })
        ));
    }
}
