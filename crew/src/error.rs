//! Typed errors for the cases callers branch on.
//!
//! Everything else propagates as `anyhow::Error` with context.

use thiserror::Error;

/// Invalid construction parameters. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),
    #[error("invalid duration '{0}' (expected <n>s|m|h|d|w)")]
    InvalidDuration(String),
    #[error("invalid run spec: {0}")]
    InvalidSpec(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Policy and lookup failures from the worktree manager.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("worktree '{0}' not found")]
    NotFound(String),
    #[error("worktree '{id}' is locked{}", .reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Locked { id: String, reason: Option<String> },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("worktree limit reached ({max} active)")]
    Limit { max: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorktreeError {
    /// Stable machine-readable kind used by the CLI and HTTP surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            WorktreeError::Invalid(_) => "invalid",
            WorktreeError::NotFound(_) => "not_found",
            WorktreeError::Locked { .. } => "locked",
            WorktreeError::Forbidden(_) => "forbidden",
            WorktreeError::Conflict(_) => "conflict",
            WorktreeError::Limit { .. } => "limit",
            WorktreeError::Other(_) => "internal",
        }
    }
}

/// Failures that end a runner stream with `Err` instead of an event.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,
    #[error("unknown engine '{0}'")]
    UnknownEngine(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
