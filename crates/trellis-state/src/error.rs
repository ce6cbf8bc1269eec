//! Error types for state store operations.

use std::path::PathBuf;

use crate::scope::Scope;

/// Result type alias using the state error type.
pub type Result<T> = std::result::Result<T, StateError>;

/// Error type for state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A non-global scope was used without the id it is keyed by.
    #[error("{scope} scope requires a {id} id")]
    ScopeIdMissing { scope: Scope, id: &'static str },

    /// Reading or writing a persistence file failed.
    #[error("Persistence I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persistence file could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
