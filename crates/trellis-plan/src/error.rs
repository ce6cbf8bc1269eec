//! Error types for plan loading and structural checks.

use std::path::PathBuf;

use thiserror::Error;

use crate::report::PlanIssue;

/// Result type for plan operations.
pub type Result<T> = std::result::Result<T, PlanError>;

/// Errors that can occur while loading or inspecting a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Failed to read a plan file.
    #[error("Failed to read plan file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File extension is neither `.toml` nor `.json`.
    #[error("Unsupported plan file format: {0}")]
    UnsupportedFormat(PathBuf),

    /// TOML plan could not be parsed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON plan could not be parsed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The plan violates a structural rule (duplicate id, dangling
    /// reference or cycle).
    #[error("Invalid plan: {}", join_issues(.0))]
    Structural(Vec<PlanIssue>),
}

fn join_issues(issues: &[PlanIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
