//! Translation of line-delimited JSON output into [`RunnerEvent`]s.
//!
//! Each stdout line is one candidate JSON document. Lines that fail to parse
//! or do not match a known shape become `log` events verbatim (minus ANSI
//! escapes). Terminal lines (`done`/`result`) and upstream `error` lines are
//! absorbed into translator state so the adapter stays the only producer of
//! the final `error`/`done` pair.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::events::{FilePatch, LogLevel, RunStats, RunnerEvent};

static ANSI_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("ansi escape regex should be valid")
});

/// Remove ANSI escape sequences from a string.
pub fn strip_ansi(value: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(value, "").into_owned()
}

/// Error reported by the backend inside its own output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamError {
    pub message: String,
    pub code: Option<String>,
    pub details: Option<Value>,
}

/// Stateful line translator for one run.
#[derive(Debug, Default)]
pub struct StreamTranslator {
    session_id: Option<String>,
    cost_usd: Option<f64>,
    token_usage: BTreeMap<String, Value>,
    tool_calls: u32,
    upstream_error: Option<UpstreamError>,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn upstream_error(&self) -> Option<&UpstreamError> {
        self.upstream_error.as_ref()
    }

    /// Translate one raw output line. Returns `None` for blank or absorbed lines.
    pub fn translate(&mut self, raw_line: &str) -> Option<RunnerEvent> {
        let line = strip_ansi(raw_line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) else {
            return Some(RunnerEvent::log(LogLevel::Info, trimmed));
        };

        let payload = match object.get("data") {
            Some(Value::Object(nested)) => nested.clone(),
            _ => object.clone(),
        };
        self.absorb_metadata(&payload);

        let kind = object
            .get("type")
            .or_else(|| payload.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        match kind {
            "log" => Some(RunnerEvent::Log {
                level: payload
                    .get("level")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
                message: string_field(&payload, &["message", "text"])
                    .unwrap_or_else(|| trimmed.to_string()),
            }),
            "message" | "assistant" | "user" => self
                .message(kind, &payload)
                .or_else(|| Some(RunnerEvent::log(LogLevel::Info, trimmed))),
            "tool_call" | "tool_use" => match string_field(&payload, &["name", "tool"]) {
                Some(name) => {
                    self.tool_calls += 1;
                    let arguments = ["arguments", "args", "input"]
                        .iter()
                        .find_map(|key| payload.get(*key).cloned())
                        .unwrap_or(Value::Null);
                    Some(RunnerEvent::ToolCall { name, arguments })
                }
                None => Some(RunnerEvent::log(LogLevel::Info, trimmed)),
            },
            "diff" => match diff_files(&payload) {
                Some(files) => Some(RunnerEvent::Diff { files }),
                None => Some(RunnerEvent::log(LogLevel::Info, trimmed)),
            },
            "error" => {
                let message = string_field(&payload, &["message", "error"])
                    .unwrap_or_else(|| "backend reported an error".to_string());
                let upstream = UpstreamError {
                    message: message.clone(),
                    code: string_field(&payload, &["code"]),
                    details: payload.get("details").cloned(),
                };
                if self.upstream_error.is_none() {
                    self.upstream_error = Some(upstream);
                }
                Some(RunnerEvent::log(LogLevel::Error, message))
            }
            "done" | "result" => None,
            _ => {
                if let (Some(role), Some(content)) = (
                    string_field(&payload, &["role"]),
                    string_field(&payload, &["content"]),
                ) {
                    return Some(RunnerEvent::Message { role, content });
                }
                Some(RunnerEvent::log(LogLevel::Info, trimmed))
            }
        }
    }

    /// Build the terminal `done` event from everything seen so far.
    pub fn done(&self, duration: Duration, exit_code: Option<i32>) -> RunnerEvent {
        RunnerEvent::Done {
            session_id: self.session_id.clone(),
            stats: Some(RunStats {
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                exit_code,
                cost_usd: self.cost_usd,
                token_usage: self.token_usage.clone(),
                tool_calls: self.tool_calls,
            }),
        }
    }

    fn message(&self, kind: &str, payload: &Map<String, Value>) -> Option<RunnerEvent> {
        // Nested `{"message": {"role": .., "content": ..}}` envelopes are common.
        let body = match payload.get("message") {
            Some(Value::Object(inner)) => inner,
            _ => payload,
        };
        let role = string_field(body, &["role"]).unwrap_or_else(|| match kind {
            "user" => "user".to_string(),
            _ => "assistant".to_string(),
        });
        let content = match body.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect();
                if texts.is_empty() {
                    return None;
                }
                texts.join("")
            }
            _ => string_field(body, &["text"])?,
        };
        Some(RunnerEvent::Message { role, content })
    }

    fn absorb_metadata(&mut self, payload: &Map<String, Value>) {
        if self.session_id.is_none() {
            self.session_id = string_field(payload, &["session_id"]).or_else(|| {
                payload
                    .get("session")
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        }
        if let Some(Value::Object(metrics)) = payload.get("metrics") {
            if let Some(cost) = metrics.get("cost_usd").and_then(Value::as_f64) {
                self.cost_usd = Some(cost);
            }
            if let Some(Value::Object(usage)) = metrics.get("token_usage") {
                for (key, value) in usage {
                    self.token_usage.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(cost) = payload.get("total_cost_usd").and_then(Value::as_f64) {
            self.cost_usd = Some(cost);
        }
    }
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn diff_files(payload: &Map<String, Value>) -> Option<Vec<FilePatch>> {
    if let Some(Value::Array(files)) = payload.get("files") {
        let patches: Vec<FilePatch> = files
            .iter()
            .filter_map(|file| {
                Some(FilePatch {
                    path: file.get("path")?.as_str()?.to_string(),
                    patch: file
                        .get("patch")
                        .or_else(|| file.get("diff"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect();
        return (!patches.is_empty()).then_some(patches);
    }
    let path = string_field(payload, &["path"])?;
    let patch = string_field(payload, &["patch", "diff"]).unwrap_or_default();
    Some(vec![FilePatch { path, patch }])
}
