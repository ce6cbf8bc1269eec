//! Persistence backends for the global and session scopes.
//!
//! The store calls [`StatePersistence::save`] with the full contents of a
//! scope after every mutation of that scope, and [`StatePersistence::load`]
//! once per scope at construction. Run and step scopes are never persisted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::entry::StateEntry;
use crate::error::{Result, StateError};
use crate::scope::Scope;

/// Entries of one scope, keyed by scoped key.
pub type ScopeSnapshot = BTreeMap<String, StateEntry>;

/// Trait for state persistence backends.
pub trait StatePersistence: Send + Sync {
    /// Load every stored entry of `scope`. Missing storage yields an empty map.
    fn load(&self, scope: Scope) -> Result<ScopeSnapshot>;

    /// Replace the stored contents of `scope`.
    fn save(&self, scope: Scope, entries: &ScopeSnapshot) -> Result<()>;
}

/// In-memory only; nothing is loaded or written.
#[derive(Debug, Clone, Default)]
pub struct NoPersistence;

impl StatePersistence for NoPersistence {
    fn load(&self, _scope: Scope) -> Result<ScopeSnapshot> {
        Ok(ScopeSnapshot::new())
    }

    fn save(&self, _scope: Scope, _entries: &ScopeSnapshot) -> Result<()> {
        Ok(())
    }
}

/// One JSON file per persistent scope (`global.json`, `session.json`).
///
/// Files are replaced atomically: contents go to a sibling temp file which
/// is then renamed over the target.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Persist into `dir`, created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the scope files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `scope`.
    pub fn path_for(&self, scope: Scope) -> PathBuf {
        self.dir.join(format!("{}.json", scope.as_str()))
    }
}

impl StatePersistence for FilePersistence {
    fn load(&self, scope: Scope) -> Result<ScopeSnapshot> {
        let path = self.path_for(scope);
        if !path.is_file() {
            return Ok(ScopeSnapshot::new());
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(ScopeSnapshot::new());
        }
        let entries: ScopeSnapshot = serde_json::from_str(&contents)?;
        debug!(scope = %scope, count = entries.len(), path = %path.display(), "Loaded state file");
        Ok(entries)
    }

    fn save(&self, scope: Scope, entries: &ScopeSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StateError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(scope);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, contents).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }
}
