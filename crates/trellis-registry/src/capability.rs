//! The capability trait and its invocation context.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_registry::{Capability, InvocationContext, Params, CapabilityResult};
//!
//! struct Upper;
//!
//! #[async_trait]
//! impl Capability for Upper {
//!     async fn invoke(&self, params: Params, _ctx: &InvocationContext) -> CapabilityResult {
//!         let text = params.get("text").and_then(|v| v.as_str()).unwrap_or_default();
//!         Ok(json!(text.to_uppercase()))
//!     }
//! }
//! ```

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Parameter map passed to a capability.
pub type Params = serde_json::Map<String, Value>;

/// Outcome of a single invocation.
pub type CapabilityResult = std::result::Result<Value, CapabilityError>;

/// Error raised by a capability during invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    /// The work itself failed.
    #[error("{0}")]
    Failed(String),

    /// The parameters were structurally acceptable but semantically wrong.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The capability observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl CapabilityError {
    /// Create a failure error.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Context provided to capabilities during invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Run this invocation belongs to.
    pub run_id: String,
    /// Session the run belongs to.
    pub session_id: String,
    /// Step being executed.
    pub step_id: String,
    /// Token to check for cancellation.
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    /// Create a new invocation context.
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            step_id: step_id.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Check if execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A named unit of invocable work.
///
/// Metadata (name, category, reliability) lives in the registry; the
/// implementation only does the work and, optionally, describes its
/// parameters as a JSON Schema object.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Run the capability.
    async fn invoke(&self, params: Params, ctx: &InvocationContext) -> CapabilityResult;

    /// JSON Schema describing the accepted parameters.
    ///
    /// When present, the registry derives parameter specs from it at
    /// registration time.
    fn schema(&self) -> Option<Value> {
        None
    }
}

/// Adapter turning an async closure into a [`Capability`].
pub struct FnCapability<F> {
    f: F,
    schema: Option<Value>,
}

impl<F> FnCapability<F> {
    /// Attach a JSON Schema for parameter synthesis.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

impl<F> std::fmt::Debug for FnCapability<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCapability")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Wrap an async closure as a capability.
///
/// The closure receives the parameter map and an owned copy of the context.
pub fn capability_fn<F, Fut>(f: F) -> FnCapability<F>
where
    F: Fn(Params, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CapabilityResult> + Send + 'static,
{
    FnCapability { f, schema: None }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Params, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CapabilityResult> + Send + 'static,
{
    async fn invoke(&self, params: Params, ctx: &InvocationContext) -> CapabilityResult {
        (self.f)(params, ctx.clone()).await
    }

    fn schema(&self) -> Option<Value> {
        self.schema.clone()
    }
}
