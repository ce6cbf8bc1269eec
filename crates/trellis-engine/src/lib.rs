//! Execution engine for trellis.
//!
//! Takes a validated [`Plan`](trellis_plan::Plan) and drives it to
//! completion:
//!
//! - Incremental readiness with ALWAYS / ON_SUCCESS / ON_FAILURE / CUSTOM
//!   conditions
//! - Bounded parallelism (`max_parallel_steps`)
//! - `$step.path` and `@key` parameter resolution at execution time
//! - Per-step timeouts and ordered fallback chains
//! - Stuck-run detection and cooperative cancellation
//! - Progress events over an mpsc channel
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Engine::new(registry, store, EngineConfig::default());
//! let outcome = engine.execute(&plan, RunContext::new("run-1", "session-1")).await?;
//! println!("{} of {} steps completed", outcome.summary.completed, outcome.summary.total);
//! ```

mod context;
mod engine;
mod error;
mod progress;
mod resolve;
mod result;
mod step;

pub use context::{RunContext, RunInputs, TraceEntry};
pub use engine::{Engine, EngineConfig, RunOutcome, STEP_OUTPUT_KEY};
pub use error::{EngineError, Result, StepError};
pub use progress::{ProgressEvent, ProgressSink};
pub use resolve::ParameterResolver;
pub use result::{Attempt, ExecutionResult, RunSummary, StepStatus};
