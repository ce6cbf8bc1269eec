//! Built-in demonstration capabilities.
//!
//! Small, side-effect free capabilities for trying plans from the command
//! line and for tests: `echo`, `sleep`, `fail`, `concat` and `json_get`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use trellis_plan::{Segment, navigate};
use trellis_registry::{
    Capability, CapabilityError, CapabilityRegistry, CapabilityResult, InvocationContext,
    ParamType, ParameterSpec, Params, Registration, Reliability, ValidationRule, capability_fn,
};

/// Category shared by every demo capability.
pub const DEMO_CATEGORY: &str = "demo";

/// Register all demo capabilities.
pub fn register_demo_capabilities(registry: &mut CapabilityRegistry) -> trellis_registry::Result<()> {
    registry.register(
        Registration::new(
            "echo",
            capability_fn(|params: Params, _ctx: InvocationContext| async move {
                Ok(params.get("value").cloned().unwrap_or(Value::Null))
            }),
        )
        .description("Return the `value` parameter unchanged")
        .category(DEMO_CATEGORY)
        .reliability(Reliability::High)
        .parameter(ParameterSpec::optional("value", ParamType::Any))
        .result_type(ParamType::Any),
    )?;

    registry.register(
        Registration::new(
            "sleep",
            capability_fn(|params: Params, ctx: InvocationContext| async move {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
                    _ = ctx.cancellation.cancelled() => Err(CapabilityError::Cancelled),
                }
            }),
        )
        .description("Wait for `ms` milliseconds")
        .category(DEMO_CATEGORY)
        .reliability(Reliability::High)
        .parameter(
            ParameterSpec::required("ms", ParamType::Integer).with_rule(ValidationRule::Minimum(0.0)),
        )
        .result_type(ParamType::Object)
        .suspends(true),
    )?;

    registry.register(
        Registration::new(
            "fail",
            capability_fn(|params: Params, _ctx: InvocationContext| async move {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure");
                Err(CapabilityError::failed(message))
            }),
        )
        .description("Always fail with `message`")
        .category(DEMO_CATEGORY)
        .reliability(Reliability::Low)
        .parameter(
            ParameterSpec::optional("message", ParamType::String)
                .with_default(json!("requested failure")),
        ),
    )?;

    registry.register(
        Registration::new(
            "concat",
            capability_fn(|params: Params, _ctx: InvocationContext| async move {
                let separator = params
                    .get("separator")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let parts = params
                    .get("parts")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CapabilityError::invalid_input("'parts' must be an array"))?;
                let joined = parts
                    .iter()
                    .map(|part| match part {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(separator);
                Ok(Value::String(joined))
            }),
        )
        .description("Join `parts` into one string")
        .category(DEMO_CATEGORY)
        .reliability(Reliability::High)
        .parameter(ParameterSpec::required("parts", ParamType::Array))
        .parameter(ParameterSpec::optional("separator", ParamType::String).with_default(json!("")))
        .result_type(ParamType::String),
    )?;

    registry.register(
        Registration::new("json_get", JsonGet)
            .description("Extract a value from `value` by dotted `path`")
            .category(DEMO_CATEGORY)
            .reliability(Reliability::High)
            .result_type(ParamType::Any),
    )?;

    Ok(())
}

/// Path lookup into a JSON value. Parameters come from its schema.
struct JsonGet;

#[async_trait]
impl Capability for JsonGet {
    async fn invoke(&self, params: Params, _ctx: &InvocationContext) -> CapabilityResult {
        let value = params.get("value").unwrap_or(&Value::Null);
        let path = params.get("path").and_then(Value::as_str).unwrap_or("");
        let segments = parse_path(path);
        navigate(value, &segments)
            .cloned()
            .ok_or_else(|| CapabilityError::invalid_input(format!("path '{path}' not found")))
    }

    fn schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "value": { "description": "Document to search" },
                "path": { "type": "string", "description": "Dotted path, e.g. items.0.name" }
            },
            "required": ["value", "path"]
        }))
    }
}

/// `a.b.0` -> field a, field b, index 0. Empty path selects the root.
fn parse_path(path: &str) -> Vec<Segment> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<usize>() {
            Ok(index) => Segment::Index(index),
            Err(_) => Segment::Field(part.to_string()),
        })
        .collect()
}
