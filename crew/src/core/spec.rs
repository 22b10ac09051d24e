//! Run requests and their validated, immutable form.
//!
//! Callers build a [`RunRequest`], validate it once with
//! [`RunRequest::validate`], and hand the resulting [`RunSpec`] to a runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::limits::ResourceLimits;
use crate::error::ConfigError;

/// Connection details for a tool server the subprocess should talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConnection {
    pub url: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl McpConnection {
    /// Environment entries forwarded to the spawned process.
    pub fn env_entries(&self) -> Vec<(String, String)> {
        vec![
            ("CREW_MCP_URL".to_string(), self.url.clone()),
            ("CREW_MCP_HOST".to_string(), self.host.clone()),
            ("CREW_MCP_PORT".to_string(), self.port.to_string()),
            ("CREW_MCP_PATH".to_string(), self.path.clone()),
            ("CREW_MCP_TOOLS".to_string(), self.tools.join(",")),
        ]
    }
}

/// Opaque extras carried alongside a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunExtra {
    /// Extra environment for the spawned process. Never applied to this process.
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    /// Retain the execution workspace after the run.
    pub keep_workspace: bool,
    /// Forward workspace-level messages into the event stream as `log` events.
    pub log_workspace_messages: bool,
    pub mcp: Option<McpConnection>,
    pub metadata: BTreeMap<String, Value>,
}

/// Unvalidated run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub engine: String,
    pub repo_root: PathBuf,
    pub prompt: String,
    #[serde(default)]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub extra: RunExtra,
}

impl RunRequest {
    pub fn new(engine: impl Into<String>, repo_root: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            repo_root: repo_root.into(),
            prompt: prompt.into(),
            resume_id: None,
            extra: RunExtra::default(),
        }
    }

    /// Check the request and freeze it.
    pub fn validate(self) -> Result<RunSpec, ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidSpec(msg));

        let engine = self.engine.trim();
        if engine.is_empty() {
            return invalid("engine must not be empty".to_string());
        }
        if !engine
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return invalid(format!("engine '{engine}' contains invalid characters"));
        }
        if self.repo_root.as_os_str().is_empty() {
            return invalid("repo_root must not be empty".to_string());
        }
        if self.prompt.trim().is_empty() {
            return invalid("prompt must not be empty".to_string());
        }
        if let Some(resume) = &self.resume_id
            && resume.trim().is_empty()
        {
            return invalid("resume_id must not be blank when provided".to_string());
        }
        for key in self.extra.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return invalid(format!("invalid environment variable name '{key}'"));
            }
        }
        let limits = self.extra.limits;
        for (name, value) in [
            ("cpu_ms", limits.cpu_ms),
            ("memory_mb", limits.memory_mb),
            ("wall_clock_ms", limits.wall_clock_ms),
        ] {
            if value == Some(0) {
                return invalid(format!("{name} must be > 0 when set"));
            }
        }

        Ok(RunSpec {
            engine: engine.to_string(),
            repo_root: self.repo_root,
            prompt: self.prompt,
            resume_id: self.resume_id,
            extra: self.extra,
        })
    }
}

/// Validated run specification. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    engine: String,
    repo_root: PathBuf,
    prompt: String,
    resume_id: Option<String>,
    extra: RunExtra,
}

impl RunSpec {
    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn resume_id(&self) -> Option<&str> {
        self.resume_id.as_deref()
    }

    pub fn extra(&self) -> &RunExtra {
        &self.extra
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.extra.limits
    }

    /// Full environment for the subprocess: caller overrides, then tool server entries.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = self.extra.env.clone();
        if let Some(mcp) = &self.extra.mcp {
            env.extend(mcp.env_entries());
        }
        env
    }

    /// Copy with a different root; used when delegation moves a run into a worktree.
    pub fn with_repo_root(&self, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..self.clone()
        }
    }

    /// Copy with additional environment entries layered over the existing ones.
    pub fn with_env<I, K, V>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.extra
            .env
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        next
    }
}
