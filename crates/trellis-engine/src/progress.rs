//! Progress events emitted while a run executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::result::{Attempt, ExecutionResult, RunSummary};

/// An event in a run's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Free-form status message.
    Status {
        run_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A step attempt began.
    StepStarted {
        run_id: String,
        step_id: String,
        capability: String,
        attempt: Attempt,
        timestamp: DateTime<Utc>,
    },
    /// A step reached a terminal state.
    StepFinished {
        run_id: String,
        result: ExecutionResult,
        timestamp: DateTime<Utc>,
    },
    /// The run is over.
    Final {
        run_id: String,
        summary: RunSummary,
        stuck: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Something the caller must not miss.
    Error {
        run_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn status(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            run_id: run_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn step_started(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        capability: impl Into<String>,
        attempt: Attempt,
    ) -> Self {
        Self::StepStarted {
            run_id: run_id.into(),
            step_id: step_id.into(),
            capability: capability.into(),
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn step_finished(run_id: impl Into<String>, result: ExecutionResult) -> Self {
        Self::StepFinished {
            run_id: run_id.into(),
            result,
            timestamp: Utc::now(),
        }
    }

    pub fn final_summary(
        run_id: impl Into<String>,
        summary: RunSummary,
        stuck: Vec<String>,
    ) -> Self {
        Self::Final {
            run_id: run_id.into(),
            summary,
            stuck,
            timestamp: Utc::now(),
        }
    }

    pub fn error(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            run_id: run_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Whether no further events follow this one.
    pub fn is_final(&self) -> bool {
        matches!(self, ProgressEvent::Final { .. })
    }
}

/// Where the engine sends progress events.
///
/// Sending never blocks the run; events are dropped once the receiver is
/// gone.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink that discards everything.
    pub fn none() -> Self {
        Self::default()
    }

    /// A sink paired with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
