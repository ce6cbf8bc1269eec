//! Trellis - capability orchestration over dependency graphs.
//!
//! This crate is the facade over the component crates:
//!
//! - [`trellis_registry`]: named capabilities with declared parameter schemas
//! - [`trellis_state`]: scoped key/value state with expiry and persistence
//! - [`trellis_plan`]: plan types, references, conditions and validation
//! - [`trellis_engine`]: bounded-parallel execution with fallbacks
//!
//! [`Orchestrator`] wires them together and offers blocking and streaming
//! entry points.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis::{Orchestrator, RunRequest};
//!
//! let orchestrator = Orchestrator::from_config(&config, registry)?;
//! let report = orchestrator.execute(&plan, RunRequest::new("session-1")).await?;
//! println!("success rate {:.0}%", report.summary.success_rate * 100.0);
//! ```

pub mod demo;
mod error;
mod orchestrator;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{DEFAULT_SESSION, Orchestrator, RunReport, RunRequest, RunStream};

pub use trellis_config as config;
pub use trellis_engine as engine;
pub use trellis_plan as plan;
pub use trellis_registry as registry;
pub use trellis_state as state;
