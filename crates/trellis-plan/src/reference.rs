//! Parameter references.
//!
//! A parameter value that is exactly one of the following strings is a
//! reference, resolved when the step executes:
//!
//! - `$step` - full output of a completed step
//! - `$step.field.nested` - dotted path into that output
//! - `$step.items[0].name` - array index access
//! - `@key`, `@key.field` - run-context input
//!
//! Anything else, including strings like `"$5.00"` or `"@"`, is a literal.

use std::fmt;

use serde_json::Value;

/// One hop of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => write!(f, ".{name}"),
            Segment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// What a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// A step output (`$`).
    StepOutput,
    /// A run-context value (`@`).
    Context,
}

/// A parsed reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub kind: ReferenceKind,
    /// Step id or context key.
    pub root: String,
    /// Path below the root value.
    pub path: Vec<Segment>,
}

impl Reference {
    /// Parse a string, returning `None` when it is a literal.
    pub fn parse(s: &str) -> Option<Reference> {
        let (kind, rest) = if let Some(rest) = s.strip_prefix('$') {
            (ReferenceKind::StepOutput, rest)
        } else if let Some(rest) = s.strip_prefix('@') {
            (ReferenceKind::Context, rest)
        } else {
            return None;
        };

        let mut chars = rest.char_indices().peekable();
        let root_end = take_identifier(&mut chars)?;
        let root = rest[..root_end].to_string();

        let mut path = Vec::new();
        while let Some((pos, c)) = chars.next() {
            match c {
                '.' => {
                    let start = pos + 1;
                    let end = take_identifier(&mut chars)?;
                    path.push(Segment::Field(rest[start..end].to_string()));
                }
                '[' => {
                    let start = pos + 1;
                    let mut end = None;
                    for (p, d) in chars.by_ref() {
                        if d == ']' {
                            end = Some(p);
                            break;
                        }
                        if !d.is_ascii_digit() {
                            return None;
                        }
                    }
                    let index = rest[start..end?].parse::<usize>().ok()?;
                    path.push(Segment::Index(index));
                }
                _ => return None,
            }
        }

        Some(Reference { kind, root, path })
    }

    /// Parse a JSON value; only strings can be references.
    pub fn from_value(value: &Value) -> Option<Reference> {
        value.as_str().and_then(Reference::parse)
    }

    /// Step id for a step-output reference.
    pub fn step_id(&self) -> Option<&str> {
        match self.kind {
            ReferenceKind::StepOutput => Some(&self.root),
            ReferenceKind::Context => None,
        }
    }

    /// Follow the path from `root_value`.
    pub fn navigate<'a>(&self, root_value: &'a Value) -> Option<&'a Value> {
        navigate(root_value, &self.path)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sigil = match self.kind {
            ReferenceKind::StepOutput => '$',
            ReferenceKind::Context => '@',
        };
        write!(f, "{sigil}{}", self.root)?;
        for segment in &self.path {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Consume an identifier (`[A-Za-z_][A-Za-z0-9_-]*`), returning its end
/// offset.
fn take_identifier(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Option<usize> {
    let &(start, first) = chars.peek()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let mut end = start;
    while let Some(&(pos, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            end = pos + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }
    Some(end)
}

/// Follow `path` through objects and arrays.
pub fn navigate<'a>(value: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        Segment::Field(name) => current.get(name.as_str()),
        Segment::Index(i) => current.get(*i),
    })
}

/// Every reference found anywhere inside `value`, with nested containers
/// searched recursively.
pub fn collect_references(value: &Value) -> Vec<Reference> {
    let mut out = Vec::new();
    collect_into(value, &mut out);
    out
}

fn collect_into(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(_) => out.extend(Reference::from_value(value)),
        Value::Array(items) => items.iter().for_each(|v| collect_into(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_into(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_step_reference() {
        let r = Reference::parse("$fetch").unwrap();
        assert_eq!(r.kind, ReferenceKind::StepOutput);
        assert_eq!(r.step_id(), Some("fetch"));
        assert!(r.path.is_empty());

        let r = Reference::parse("$fetch.body.items[2].name").unwrap();
        assert_eq!(
            r.path,
            vec![
                Segment::Field("body".into()),
                Segment::Field("items".into()),
                Segment::Index(2),
                Segment::Field("name".into()),
            ]
        );
        assert_eq!(r.to_string(), "$fetch.body.items[2].name");
    }

    #[test]
    fn test_parse_context_reference() {
        let r = Reference::parse("@document.title").unwrap();
        assert_eq!(r.kind, ReferenceKind::Context);
        assert_eq!(r.root, "document");
        assert!(r.step_id().is_none());
    }

    #[test]
    fn test_literals_are_not_references() {
        for literal in [
            "$5.00",
            "$",
            "@",
            "plain",
            "$a.",
            "$a..b",
            "$a[x]",
            "$a[1",
            "$a b",
            "user@example.com",
            "$a-b.c d",
        ] {
            assert!(Reference::parse(literal).is_none(), "{literal} parsed");
        }
        assert!(Reference::from_value(&json!(5)).is_none());
    }

    #[test]
    fn test_hyphenated_ids() {
        let r = Reference::parse("$step-1.out").unwrap();
        assert_eq!(r.root, "step-1");
    }

    #[test]
    fn test_navigate() {
        let value = json!({"items": [{"name": "a"}, {"name": "b"}]});
        let r = Reference::parse("$x.items[1].name").unwrap();
        assert_eq!(r.navigate(&value), Some(&json!("b")));
        let r = Reference::parse("$x.items[5]").unwrap();
        assert!(r.navigate(&value).is_none());
        let r = Reference::parse("$x.missing").unwrap();
        assert!(r.navigate(&value).is_none());
    }

    #[test]
    fn test_collect_nested_references() {
        let value = json!({
            "a": "$one",
            "b": ["literal", "@key", {"c": "$two.x"}],
            "d": 3
        });
        let roots: Vec<String> = collect_references(&value)
            .into_iter()
            .map(|r| r.root)
            .collect();
        assert_eq!(roots.len(), 3);
        assert!(roots.contains(&"one".to_string()));
        assert!(roots.contains(&"key".to_string()));
        assert!(roots.contains(&"two".to_string()));
    }
}
