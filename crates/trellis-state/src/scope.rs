//! Scopes and scoped key construction.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::StateEntry;
use crate::error::{Result, StateError};

/// Lifetime and visibility tier of a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Process-wide.
    Global,
    /// Shared by every run in one session.
    Session,
    /// One graph execution.
    Run,
    /// One step within a run.
    Step,
}

impl Scope {
    /// All scopes, widest first.
    pub const ALL: [Scope; 4] = [Scope::Global, Scope::Session, Scope::Run, Scope::Step];

    /// Whether entries in this scope are written to the persistence backend.
    pub fn is_persistent(self) -> bool {
        matches!(self, Scope::Global | Scope::Session)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Session => "session",
            Scope::Run => "run",
            Scope::Step => "step",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers a non-global scope is keyed by.
///
/// Session scope needs `session_id`; run scope needs `run_id`; step scope
/// needs both `run_id` and `step_id`. Extra ids are ignored for key
/// construction but recorded on the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ScopeIds {
    /// No ids (global scope).
    pub fn none() -> Self {
        Self::default()
    }

    /// Ids for session scope.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::default().with_session(session_id)
    }

    /// Ids for run scope.
    pub fn run(run_id: impl Into<String>) -> Self {
        Self::default().with_run(run_id)
    }

    /// Ids for step scope.
    pub fn step(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self::default().with_run(run_id).with_step(step_id)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// True when no id is set.
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.run_id.is_none() && self.step_id.is_none()
    }

    /// Keep only the ids that `scope` is keyed by.
    pub(crate) fn narrowed(&self, scope: Scope) -> ScopeIds {
        match scope {
            Scope::Global => ScopeIds::none(),
            Scope::Session => ScopeIds {
                session_id: self.session_id.clone(),
                ..Default::default()
            },
            Scope::Run => ScopeIds {
                run_id: self.run_id.clone(),
                ..Default::default()
            },
            Scope::Step => ScopeIds {
                run_id: self.run_id.clone(),
                step_id: self.step_id.clone(),
                ..Default::default()
            },
        }
    }
}

fn require<'a>(id: Option<&'a String>, scope: Scope, name: &'static str) -> Result<&'a str> {
    match id {
        Some(id) if !id.is_empty() => Ok(id.as_str()),
        _ => Err(StateError::ScopeIdMissing { scope, id: name }),
    }
}

/// Escape the separator in an id component so ids containing `:` cannot
/// shift the boundary between ids and key.
fn escape(id: &str) -> Cow<'_, str> {
    if id.contains([':', '%']) {
        Cow::Owned(id.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(id)
    }
}

/// Identity of a stored entry.
///
/// The store indexes entries by this triple rather than by the rendered
/// string, so a global key that happens to look like `session:X:doc` never
/// aliases `doc` in session `X`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EntryKey {
    scope: Scope,
    ids: ScopeIds,
    key: String,
}

impl EntryKey {
    /// Key for `key` in `scope`, failing when a required id is missing.
    pub(crate) fn new(key: &str, scope: Scope, ids: &ScopeIds) -> Result<Self> {
        match scope {
            Scope::Global => {}
            Scope::Session => {
                require(ids.session_id.as_ref(), scope, "session")?;
            }
            Scope::Run => {
                require(ids.run_id.as_ref(), scope, "run")?;
            }
            Scope::Step => {
                require(ids.run_id.as_ref(), scope, "run")?;
                require(ids.step_id.as_ref(), scope, "step")?;
            }
        }
        Ok(Self {
            scope,
            ids: ids.narrowed(scope),
            key: key.to_string(),
        })
    }

    /// Key of an entry already held (or loaded from disk).
    pub(crate) fn of(entry: &StateEntry) -> Self {
        Self {
            scope: entry.scope,
            ids: entry.ids.narrowed(entry.scope),
            key: entry.key.clone(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = |id: &Option<String>| escape(id.as_deref().unwrap_or_default()).into_owned();
        match self.scope {
            Scope::Global => write!(f, "{}", self.key),
            Scope::Session => write!(f, "session:{}:{}", id(&self.ids.session_id), self.key),
            Scope::Run => write!(f, "run:{}:{}", id(&self.ids.run_id), self.key),
            Scope::Step => write!(
                f,
                "step:{}:{}:{}",
                id(&self.ids.run_id),
                id(&self.ids.step_id),
                self.key
            ),
        }
    }
}

/// Build the storage key for `key` in `scope`.
///
/// | scope   | key                         |
/// |---------|-----------------------------|
/// | global  | `key`                       |
/// | session | `session:<sid>:key`         |
/// | run     | `run:<rid>:key`             |
/// | step    | `step:<rid>:<step>:key`     |
///
/// `:` and `%` inside ids are percent-escaped, so the string is unique
/// within a scope. It labels entries in persisted files and logs; lookups
/// go through the structured key.
pub fn scoped_key(key: &str, scope: Scope, ids: &ScopeIds) -> Result<String> {
    Ok(EntryKey::new(key, scope, ids)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_keys() {
        assert_eq!(
            scoped_key("k", Scope::Global, &ScopeIds::none()).unwrap(),
            "k"
        );
        assert_eq!(
            scoped_key("k", Scope::Session, &ScopeIds::session("s1")).unwrap(),
            "session:s1:k"
        );
        assert_eq!(
            scoped_key("k", Scope::Run, &ScopeIds::run("r1")).unwrap(),
            "run:r1:k"
        );
        assert_eq!(
            scoped_key("k", Scope::Step, &ScopeIds::step("r1", "fetch")).unwrap(),
            "step:r1:fetch:k"
        );
    }

    #[test]
    fn test_missing_ids_are_errors() {
        let err = scoped_key("k", Scope::Session, &ScopeIds::run("r1")).unwrap_err();
        assert!(matches!(
            err,
            StateError::ScopeIdMissing {
                scope: Scope::Session,
                id: "session"
            }
        ));

        let err = scoped_key("k", Scope::Step, &ScopeIds::run("r1")).unwrap_err();
        assert!(matches!(err, StateError::ScopeIdMissing { id: "step", .. }));

        let err = scoped_key("k", Scope::Run, &ScopeIds::session("")).unwrap_err();
        assert_eq!(err.to_string(), "run scope requires a run id");

        assert!(scoped_key("k", Scope::Session, &ScopeIds::session("")).is_err());
    }

    #[test]
    fn test_global_ignores_ids() {
        let ids = ScopeIds::session("s1").with_run("r1");
        assert_eq!(scoped_key("k", Scope::Global, &ids).unwrap(), "k");
        assert!(ids.narrowed(Scope::Global).is_empty());
        assert_eq!(ids.narrowed(Scope::Run), ScopeIds::run("r1"));
    }

    #[test]
    fn test_ids_with_separator_are_escaped() {
        let nested = scoped_key("c", Scope::Session, &ScopeIds::session("a:b")).unwrap();
        let flat = scoped_key("b:c", Scope::Session, &ScopeIds::session("a")).unwrap();
        assert_eq!(nested, "session:a%3Ab:c");
        assert_eq!(flat, "session:a:b:c");
        assert_ne!(nested, flat);
        assert_eq!(
            scoped_key("k", Scope::Step, &ScopeIds::step("r%1", "x")).unwrap(),
            "step:r%251:x:k"
        );
    }

    #[test]
    fn test_entry_keys_differ_across_scopes() {
        let global = EntryKey::new("session:X:doc", Scope::Global, &ScopeIds::none()).unwrap();
        let session = EntryKey::new("doc", Scope::Session, &ScopeIds::session("X")).unwrap();
        assert_eq!(global.to_string(), session.to_string());
        assert_ne!(global, session);
    }
}
