//! Error types for the capability registry.

use thiserror::Error;

/// Result type alias using the registry error type.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No capability with this name is registered.
    #[error("Capability not found: {0}")]
    NotFound(String),

    /// A capability with this name already exists with different metadata.
    #[error("Capability '{0}' is already registered with different metadata")]
    DuplicateCapability(String),

    /// The registration itself is malformed.
    #[error("Invalid registration for '{name}': {reason}")]
    InvalidRegistration { name: String, reason: String },
}
