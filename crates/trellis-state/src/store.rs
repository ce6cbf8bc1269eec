//! The multi-scope state store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use trellis_config::StateSection;

use crate::entry::{SetOptions, StateEntry};
use crate::error::Result;
use crate::persistence::{FilePersistence, NoPersistence, ScopeSnapshot, StatePersistence};
use crate::scope::{EntryKey, Scope, ScopeIds};

/// Run-scope key under which a saved run context is stored.
pub const RUN_CONTEXT_KEY: &str = "__run_context";

/// Per-scope accounting returned by [`StateStore::summary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScopeSummary {
    /// Number of entries held (expired entries count until evicted).
    pub entry_count: usize,
    /// Approximate bytes held.
    pub approx_size: usize,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<EntryKey, StateEntry>,
    /// run id -> session id.
    runs: HashMap<String, String>,
}

impl StoreInner {
    fn snapshot(&self, scope: Scope) -> ScopeSnapshot {
        self.entries
            .iter()
            .filter(|(_, e)| e.scope == scope)
            .map(|(k, e)| (k.to_string(), e.clone()))
            .collect()
    }

    fn remove_run(&mut self, run_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            !(matches!(e.scope, Scope::Run | Scope::Step)
                && e.ids.run_id.as_deref() == Some(run_id))
        });
        self.runs.remove(run_id);
        before - self.entries.len()
    }
}

/// Multi-scope key/value store with expiry, versioning and optional
/// persistence of the global and session scopes.
///
/// All reads and writes go through one reader/writer lock. Persistence
/// happens synchronously under that lock and is best-effort: a failed write
/// is logged and the in-memory state stays authoritative.
pub struct StateStore {
    inner: RwLock<StoreInner>,
    persistence: Arc<dyn StatePersistence>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StateStore")
            .field("entries", &inner.entries.len())
            .field("runs", &inner.runs.len())
            .finish()
    }
}

impl StateStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            persistence: Arc::new(NoPersistence),
        }
    }

    /// Store backed by `persistence`, eagerly loading the global and
    /// session scopes.
    pub fn with_persistence(persistence: Arc<dyn StatePersistence>) -> Result<Self> {
        let mut inner = StoreInner::default();
        for scope in [Scope::Global, Scope::Session] {
            let loaded = persistence.load(scope)?;
            debug!(scope = %scope, count = loaded.len(), "Loaded persisted state");
            inner
                .entries
                .extend(loaded.into_values().map(|e| (EntryKey::of(&e), e)));
        }
        Ok(Self {
            inner: RwLock::new(inner),
            persistence,
        })
    }

    /// Store configured from the `[state]` section.
    pub fn from_config(config: &StateSection) -> Result<Self> {
        match config.persistence_dir {
            Some(ref dir) => Self::with_persistence(Arc::new(FilePersistence::new(dir))),
            None => Ok(Self::new()),
        }
    }

    fn persist(&self, scope: Scope, inner: &StoreInner) {
        if !scope.is_persistent() {
            return;
        }
        if let Err(e) = self.persistence.save(scope, &inner.snapshot(scope)) {
            warn!(scope = %scope, error = %e, "Failed to persist state; keeping in-memory copy");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Key/value operations
    // ─────────────────────────────────────────────────────────────────────

    /// Write a value, returning the entry's new version.
    ///
    /// Overwriting a live entry keeps its creation time, bumps its version
    /// and merges metadata unless `replace_metadata` is set. The expiry is
    /// always taken from `opts`.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        scope: Scope,
        ids: &ScopeIds,
        opts: SetOptions,
    ) -> Result<u64> {
        let skey = EntryKey::new(key, scope, ids)?;
        let now = Utc::now();
        let expires_at = opts.expiry_from(now);

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let version = if let Some(existing) = inner
            .entries
            .get_mut(&skey)
            .filter(|e| !e.is_expired_at(now))
        {
            existing.value = value;
            existing.updated_at = now;
            existing.version += 1;
            existing.expires_at = expires_at;
            match opts.metadata {
                Some(meta) if opts.replace_metadata => existing.metadata = meta,
                Some(meta) => existing.metadata.extend(meta),
                None if opts.replace_metadata => existing.metadata.clear(),
                None => {}
            }
            existing.version
        } else {
            inner.entries.insert(
                skey.clone(),
                StateEntry {
                    key: key.to_string(),
                    value,
                    scope,
                    ids: ids.narrowed(scope),
                    created_at: now,
                    updated_at: now,
                    version: 1,
                    expires_at,
                    metadata: opts.metadata.unwrap_or_default(),
                },
            );
            1
        };

        debug!(scope = %scope, key = %skey, version, "State set");
        self.persist(scope, inner);
        Ok(version)
    }

    /// Copy of the full entry, if present and not expired.
    ///
    /// An expired entry is evicted on the way out.
    pub fn entry(&self, key: &str, scope: Scope, ids: &ScopeIds) -> Result<Option<StateEntry>> {
        let skey = EntryKey::new(key, scope, ids)?;
        let now = Utc::now();

        let guard = self.inner.upgradable_read();
        match guard.entries.get(&skey) {
            None => return Ok(None),
            Some(e) if !e.is_expired_at(now) => return Ok(Some(e.clone())),
            Some(_) => {}
        }

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        guard.entries.remove(&skey);
        trace!(scope = %scope, key = %skey, "Evicted expired entry on read");
        self.persist(scope, &guard);
        Ok(None)
    }

    /// Value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str, scope: Scope, ids: &ScopeIds) -> Result<Option<Value>> {
        Ok(self.entry(key, scope, ids)?.map(|e| e.value))
    }

    /// Value for `key`, or `default` when absent or expired.
    pub fn get_or(&self, key: &str, scope: Scope, ids: &ScopeIds, default: Value) -> Result<Value> {
        Ok(self.get(key, scope, ids)?.unwrap_or(default))
    }

    /// Whether a live entry exists.
    pub fn has(&self, key: &str, scope: Scope, ids: &ScopeIds) -> Result<bool> {
        Ok(self.entry(key, scope, ids)?.is_some())
    }

    /// Remove an entry. Returns false when there was no live entry.
    pub fn delete(&self, key: &str, scope: Scope, ids: &ScopeIds) -> Result<bool> {
        let skey = EntryKey::new(key, scope, ids)?;
        let now = Utc::now();

        let mut guard = self.inner.write();
        let Some(removed) = guard.entries.remove(&skey) else {
            return Ok(false);
        };
        debug!(scope = %scope, key = %skey, "State deleted");
        self.persist(scope, &guard);
        Ok(!removed.is_expired_at(now))
    }

    /// Live keys in a scope for the given ids, sorted.
    pub fn keys(&self, scope: Scope, ids: &ScopeIds) -> Result<Vec<String>> {
        // Validates that the scope's ids are present.
        EntryKey::new("", scope, ids)?;
        let owner = ids.narrowed(scope);
        let now = Utc::now();

        let inner = self.inner.read();
        let mut keys: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.scope == scope && e.ids == owner && !e.is_expired_at(now))
            .map(|e| e.key.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Number of held entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────

    /// Record that `run_id` belongs to `session_id`.
    pub fn register_run(&self, run_id: &str, session_id: &str) {
        self.inner
            .write()
            .runs
            .insert(run_id.to_string(), session_id.to_string());
        trace!(run_id, session_id, "Run registered");
    }

    /// Session a run was registered under.
    pub fn run_session(&self, run_id: &str) -> Option<String> {
        self.inner.read().runs.get(run_id).cloned()
    }

    /// Runs registered under a session, sorted.
    pub fn session_runs(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut runs: Vec<String> = inner
            .runs
            .iter()
            .filter(|(_, sid)| sid.as_str() == session_id)
            .map(|(rid, _)| rid.clone())
            .collect();
        runs.sort_unstable();
        runs
    }

    /// Store a serialized run context in the run scope.
    pub fn save_run_context(&self, run_id: &str, context: Value) -> Result<u64> {
        self.set(
            RUN_CONTEXT_KEY,
            context,
            Scope::Run,
            &ScopeIds::run(run_id),
            SetOptions::new(),
        )
    }

    /// A previously saved run context.
    pub fn run_context(&self, run_id: &str) -> Result<Option<Value>> {
        self.get(RUN_CONTEXT_KEY, Scope::Run, &ScopeIds::run(run_id))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cleanup
    // ─────────────────────────────────────────────────────────────────────

    /// Remove every run and step entry of a run, its saved context and its
    /// registration. Returns the number of entries removed.
    pub fn cleanup_run(&self, run_id: &str) -> usize {
        let removed = self.inner.write().remove_run(run_id);
        debug!(run_id, removed, "Run state cleaned up");
        removed
    }

    /// Remove every session entry of a session plus all of its runs.
    /// Returns the number of entries removed.
    pub fn cleanup_session(&self, session_id: &str) -> usize {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            !(e.scope == Scope::Session && e.ids.session_id.as_deref() == Some(session_id))
        });
        let session_removed = before - inner.entries.len();

        let runs: Vec<String> = inner
            .runs
            .iter()
            .filter(|(_, sid)| sid.as_str() == session_id)
            .map(|(rid, _)| rid.clone())
            .collect();
        let run_removed: usize = runs.iter().map(|rid| inner.remove_run(rid)).sum();

        if session_removed > 0 {
            self.persist(Scope::Session, inner);
        }
        debug!(
            session_id,
            runs = runs.len(),
            removed = session_removed + run_removed,
            "Session state cleaned up"
        );
        session_removed + run_removed
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.write();

        let expired: Vec<(EntryKey, Scope)> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, e)| (k.clone(), e.scope))
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut touched = Vec::new();
        for (key, scope) in &expired {
            guard.entries.remove(key);
            if !touched.contains(scope) {
                touched.push(*scope);
            }
        }
        for scope in touched {
            self.persist(scope, &guard);
        }

        debug!(removed = expired.len(), "Swept expired state entries");
        expired.len()
    }

    /// Entry counts and sizes per scope.
    ///
    /// With a session id, the session scope only counts that session and
    /// the run and step scopes only count runs registered under it.
    pub fn summary(&self, session_id: Option<&str>) -> BTreeMap<Scope, ScopeSummary> {
        let inner = self.inner.read();
        let mut out: BTreeMap<Scope, ScopeSummary> = Scope::ALL
            .iter()
            .map(|s| (*s, ScopeSummary::default()))
            .collect();

        for entry in inner.entries.values() {
            let included = match (session_id, entry.scope) {
                (None, _) | (_, Scope::Global) => true,
                (Some(sid), Scope::Session) => entry.ids.session_id.as_deref() == Some(sid),
                (Some(sid), Scope::Run | Scope::Step) => entry
                    .ids
                    .run_id
                    .as_ref()
                    .and_then(|rid| inner.runs.get(rid))
                    .is_some_and(|owner| owner == sid),
            };
            if included {
                let slot = out.entry(entry.scope).or_default();
                slot.entry_count += 1;
                slot.approx_size += entry.approx_size();
            }
        }
        out
    }
}
