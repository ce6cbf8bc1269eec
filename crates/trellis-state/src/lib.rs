//! Multi-scope state store for trellis.
//!
//! Entries live in one of four scopes (global, session, run, step) and
//! carry a version, timestamps, optional expiry and free-form metadata.
//! The global and session scopes can be persisted through a pluggable
//! [`StatePersistence`] backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_state::{StateStore, Scope, ScopeIds, SetOptions};
//!
//! let store = StateStore::new();
//! store.set("doc", json!("..."), Scope::Session, &ScopeIds::session("s1"), SetOptions::new())?;
//! ```

mod entry;
mod error;
mod persistence;
mod scope;
mod store;
mod sweeper;

pub use entry::{SetOptions, StateEntry};
pub use error::{Result, StateError};
pub use persistence::{FilePersistence, NoPersistence, ScopeSnapshot, StatePersistence};
pub use scope::{Scope, ScopeIds, scoped_key};
pub use store::{RUN_CONTEXT_KEY, ScopeSummary, StateStore};
pub use sweeper::SweeperHandle;
