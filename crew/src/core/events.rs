//! Typed events produced by runner adapters.
//!
//! A run's stream is ordered and finite. It always ends with exactly one
//! [`RunnerEvent::Done`]; a failing run emits [`RunnerEvent::Error`]
//! immediately before it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity attached to [`RunnerEvent::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// One file touched by a [`RunnerEvent::Diff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub patch: String,
}

/// Summary attached to the terminal [`RunnerEvent::Done`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunStats {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token_usage: BTreeMap<String, Value>,
    #[serde(default)]
    pub tool_calls: u32,
}

/// One point in a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
    Message {
        role: String,
        content: String,
    },
    Diff {
        files: Vec<FilePatch>,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<RunStats>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl RunnerEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        RunnerEvent::Log {
            level,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>, details: Option<Value>) -> Self {
        RunnerEvent::Error {
            message: message.into(),
            code: code.map(str::to_string),
            details,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, RunnerEvent::Done { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunnerEvent::Error { .. })
    }

    /// Wire name of the variant (`"tool_call"`, `"done"`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerEvent::Log { .. } => "log",
            RunnerEvent::Message { .. } => "message",
            RunnerEvent::Diff { .. } => "diff",
            RunnerEvent::ToolCall { .. } => "tool_call",
            RunnerEvent::Done { .. } => "done",
            RunnerEvent::Error { .. } => "error",
        }
    }
}

/// Check the termination contract of a complete event sequence.
///
/// Returns the list of violations; an empty list means the stream is well formed.
pub fn stream_violations(events: &[RunnerEvent]) -> Vec<String> {
    let mut errors = Vec::new();
    let done_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_done())
        .map(|(i, _)| i)
        .collect();

    match done_positions.as_slice() {
        [] => errors.push("stream has no done event".to_string()),
        [pos] if *pos != events.len() - 1 => {
            errors.push(format!("done event at {pos} is not the last event"));
        }
        [_] => {}
        many => errors.push(format!("stream has {} done events", many.len())),
    }

    for (idx, event) in events.iter().enumerate() {
        if event.is_error() {
            let followed_by_done = events.get(idx + 1).is_some_and(RunnerEvent::is_done);
            if !followed_by_done {
                errors.push(format!("error event at {idx} is not followed by done"));
            }
        }
    }
    errors
}
