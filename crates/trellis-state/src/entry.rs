//! State entries and write options.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scope::{Scope, ScopeIds};

/// A stored value with its bookkeeping.
///
/// Callers always receive copies; the store owns the originals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Caller-facing key (without scope prefix).
    pub key: String,
    /// Stored value.
    pub value: Value,
    /// Scope the entry lives in.
    pub scope: Scope,
    /// Ids the entry is keyed by.
    #[serde(default, skip_serializing_if = "ScopeIds::is_empty")]
    pub ids: ScopeIds,
    /// First write.
    pub created_at: DateTime<Utc>,
    /// Last write.
    #[serde(rename = "timestamp")]
    pub updated_at: DateTime<Utc>,
    /// Starts at 1 and increments on every write.
    pub version: u64,
    /// Absolute expiry time, if any.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StateEntry {
    /// Whether the entry is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the entry is past its expiry.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Rough memory footprint in bytes (key plus encoded value).
    pub fn approx_size(&self) -> usize {
        let value_len = serde_json::to_vec(&self.value)
            .map(|v| v.len())
            .unwrap_or(0);
        self.key.len() + value_len
    }
}

/// Options for a single write.
///
/// ```rust,ignore
/// store.set(
///     "token",
///     json!("abc"),
///     Scope::Session,
///     &ScopeIds::session("s1"),
///     SetOptions::new().expires_in(Duration::from_secs(60)),
/// )?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Relative expiry. `None` means the entry never expires.
    pub expires_in: Option<Duration>,
    /// Metadata to attach.
    pub metadata: Option<Map<String, Value>>,
    /// Replace prior metadata instead of merging into it.
    pub replace_metadata: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expires_in(mut self, duration: Duration) -> Self {
        self.expires_in = Some(duration);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Add one metadata field.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn replace_metadata(mut self) -> Self {
        self.replace_metadata = true;
        self
    }

    pub(crate) fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .and_then(|d| TimeDelta::from_std(d).ok())
            .and_then(|d| now.checked_add_signed(d))
    }
}
