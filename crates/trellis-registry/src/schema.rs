//! Parameter schemas and validation rules.
//!
//! A capability declares its parameters as a list of [`ParameterSpec`]s. The
//! list can be written by hand or synthesized from a JSON Schema object with
//! [`parameters_from_schema`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Reliability
// ─────────────────────────────────────────────────────────────────────────────

/// Reliability class of a capability, carried into results as confidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    /// Deterministic or well-tested work.
    High,
    /// The usual case.
    #[default]
    Medium,
    /// Heuristic or flaky work.
    Low,
    /// Unproven capabilities.
    Experimental,
}

impl Reliability {
    /// Confidence weight in `[0, 1]`.
    pub fn weight(self) -> f64 {
        match self {
            Self::High => 0.95,
            Self::Medium => 0.80,
            Self::Low => 0.60,
            Self::Experimental => 0.40,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Declared type of a parameter or result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ParamType {
    /// Map a JSON Schema `type` keyword.
    pub fn from_json_type(name: &str) -> Self {
        match name {
            "string" => Self::String,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => Self::Any,
        }
    }

    /// Whether `value` is acceptable for this type.
    ///
    /// Integers are accepted where numbers are expected, and `Any` accepts
    /// everything including null.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    /// Name used in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// JSON type name of a concrete value.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules
// ─────────────────────────────────────────────────────────────────────────────

/// Extra constraint on a parameter value beyond its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    /// Minimum length of a string (chars) or array (items).
    MinLength(usize),
    /// Maximum length of a string (chars) or array (items).
    MaxLength(usize),
    /// Inclusive numeric lower bound.
    Minimum(f64),
    /// Inclusive numeric upper bound.
    Maximum(f64),
    /// Strings, arrays and objects must not be empty; null is rejected.
    NonEmpty,
    /// Value must equal one of the listed values.
    OneOf(Vec<Value>),
}

impl ValidationRule {
    /// Check a value, returning a human-readable reason on violation.
    ///
    /// Rules that do not apply to the value's type pass.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::MinLength(min) => match length_of(value) {
                Some(len) if len < *min => Err(format!("length {len} is below minimum {min}")),
                _ => Ok(()),
            },
            Self::MaxLength(max) => match length_of(value) {
                Some(len) if len > *max => Err(format!("length {len} exceeds maximum {max}")),
                _ => Ok(()),
            },
            Self::Minimum(min) => match value.as_f64() {
                Some(n) if n < *min => Err(format!("{n} is below minimum {min}")),
                _ => Ok(()),
            },
            Self::Maximum(max) => match value.as_f64() {
                Some(n) if n > *max => Err(format!("{n} exceeds maximum {max}")),
                _ => Ok(()),
            },
            Self::NonEmpty => {
                let empty = match value {
                    Value::Null => true,
                    Value::String(s) => s.trim().is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    _ => false,
                };
                if empty {
                    Err("must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
            Self::OneOf(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    let options: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                    Err(format!("must be one of [{}]", options.join(", ")))
                }
            }
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameter Spec
// ─────────────────────────────────────────────────────────────────────────────

/// Declared parameter of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be supplied.
    pub required: bool,
    /// Value used when the parameter is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Additional constraints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ValidationRule>,
}

impl ParameterSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            description: String::new(),
            rules: Vec::new(),
        }
    }

    /// An optional parameter without a default.
    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    /// Attach a default value. A parameter with a default is never required.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a validation rule.
    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Synthesize parameter specs from a JSON Schema object.
///
/// Reads `properties`, `required`, each property's `type`, `default`,
/// `description`, and the `minLength`/`maxLength`/`minItems`/`maxItems`/
/// `minimum`/`maximum`/`enum` keywords. A property with a default is optional
/// even if listed in `required`.
pub fn parameters_from_schema(schema: &Value) -> Vec<ParameterSpec> {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| {
            let param_type = match prop.get("type") {
                Some(Value::String(t)) => ParamType::from_json_type(t),
                // ["string", "null"] style unions: first non-null member wins
                Some(Value::Array(types)) => types
                    .iter()
                    .filter_map(|t| t.as_str())
                    .find(|t| *t != "null")
                    .map(ParamType::from_json_type)
                    .unwrap_or_default(),
                _ => ParamType::Any,
            };

            let mut spec = if required.contains(&name.as_str()) {
                ParameterSpec::required(name.clone(), param_type)
            } else {
                ParameterSpec::optional(name.clone(), param_type)
            };
            if let Some(default) = prop.get("default") {
                spec = spec.with_default(default.clone());
            }
            if let Some(desc) = prop.get("description").and_then(|d| d.as_str()) {
                spec.description = desc.to_string();
            }

            for keyword in ["minLength", "minItems"] {
                if let Some(n) = prop.get(keyword).and_then(|v| v.as_u64()) {
                    spec.rules.push(ValidationRule::MinLength(n as usize));
                }
            }
            for keyword in ["maxLength", "maxItems"] {
                if let Some(n) = prop.get(keyword).and_then(|v| v.as_u64()) {
                    spec.rules.push(ValidationRule::MaxLength(n as usize));
                }
            }
            if let Some(n) = prop.get("minimum").and_then(|v| v.as_f64()) {
                spec.rules.push(ValidationRule::Minimum(n));
            }
            if let Some(n) = prop.get("maximum").and_then(|v| v.as_f64()) {
                spec.rules.push(ValidationRule::Maximum(n));
            }
            if let Some(options) = prop.get("enum").and_then(|v| v.as_array()) {
                spec.rules.push(ValidationRule::OneOf(options.clone()));
            }

            spec
        })
        .collect()
}
