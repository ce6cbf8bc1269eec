//! Capability registry for trellis.
//!
//! This crate provides:
//! - The [`Capability`] trait implemented by every unit of work
//! - Parameter specs, validation rules and JSON Schema synthesis
//! - [`CapabilityRegistry`] with lookup, parameter validation,
//!   alternative suggestions and free-text candidate search
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_registry::{CapabilityRegistry, Registration, ParameterSpec, ParamType, Reliability};
//!
//! let mut registry = CapabilityRegistry::new();
//! registry.register(
//!     Registration::new("web_fetch", WebFetch)
//!         .category("retrieval")
//!         .reliability(Reliability::Medium)
//!         .parameter(ParameterSpec::required("url", ParamType::String)),
//! )?;
//! ```

mod capability;
mod error;
mod registry;
mod schema;

pub use capability::{
    Capability, CapabilityError, CapabilityResult, FnCapability, InvocationContext, Params,
    capability_fn,
};
pub use error::{RegistryError, Result};
pub use registry::{
    Candidate, CapabilityDescriptor, CapabilityRegistry, IssueKind, MAX_ALTERNATIVES,
    ParamValidation, ParameterIssue, RegisteredCapability, Registration, apply_defaults,
    validate_params,
};
pub use schema::{
    ParamType, ParameterSpec, Reliability, ValidationRule, parameters_from_schema,
    value_type_name,
};
