//! Test-only helpers: throwaway git repositories, recording log sinks and
//! scripted runners.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::core::events::{LogLevel, RunStats, RunnerEvent};
use crate::core::spec::RunSpec;
use crate::error::RunError;
use crate::io::workspace::LogSink;
use crate::io::worktree::{WorktreeManager, WorktreeSettings};
use crate::runner::{EventStream, Runner};

/// A git repository with one commit on `main` and a `base` branch, plus a
/// sibling directory for managed worktrees.
pub struct TestRepo {
    _temp: TempDir,
    repo: PathBuf,
    worktrees: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = temp.path().join("repo");
        let worktrees = temp.path().join("worktrees");
        fs::create_dir_all(&repo).context("create repo dir")?;

        let this = Self {
            _temp: temp,
            repo,
            worktrees,
        };
        this.git(&["init", "-q"])?;
        this.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        this.git(&["config", "user.email", "crew@example.com"])?;
        this.git(&["config", "user.name", "crew tests"])?;
        this.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(this.repo.join("README.md"), "# fixture\n").context("write README")?;
        this.git(&["add", "README.md"])?;
        this.git(&["commit", "-q", "-m", "init"])?;
        this.git(&["branch", "base"])?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.repo
    }

    /// Directory the managers created by [`TestRepo::manager`] use as root.
    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees
    }

    pub fn settings(&self, max_concurrency: usize) -> WorktreeSettings {
        WorktreeSettings {
            root: self.worktrees.clone(),
            max_concurrency,
            ttl: Duration::from_secs(14 * 24 * 60 * 60),
            ttl_spec: "14d".to_string(),
            allow_force: false,
            protected_branches: vec!["main".to_string(), "master".to_string()],
        }
    }

    pub fn manager(&self, max_concurrency: usize) -> Result<WorktreeManager> {
        WorktreeManager::new(&self.repo, self.settings(max_concurrency))
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .is_ok()
    }
}

/// Log sink that remembers every message.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(LogLevel, String)> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(_, m)| m.contains(needle))
    }
}

impl LogSink for RecordingSink {
    fn log(&self, level: LogLevel, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((level, message.to_string()));
        }
    }
}

/// Runner that replays a fixed event sequence and records the specs it saw.
#[derive(Debug, Clone)]
pub struct ScriptedRunner {
    engine: String,
    events: Vec<RunnerEvent>,
    delay: Option<Duration>,
    seen: Arc<Mutex<Vec<RunSpec>>>,
}

impl ScriptedRunner {
    pub fn new(engine: &str, events: Vec<RunnerEvent>) -> Self {
        Self {
            engine: engine.to_string(),
            events,
            delay: None,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// One assistant message, then `done`.
    pub fn succeeding(engine: &str, content: &str) -> Self {
        Self::new(
            engine,
            vec![
                RunnerEvent::Message {
                    role: "assistant".to_string(),
                    content: content.to_string(),
                },
                RunnerEvent::Done {
                    session_id: Some("scripted-session".to_string()),
                    stats: Some(RunStats::default()),
                },
            ],
        )
    }

    /// `error` then `done`.
    pub fn failing(engine: &str, message: &str) -> Self {
        Self::new(
            engine,
            vec![
                RunnerEvent::error(message, Some("scripted"), None),
                RunnerEvent::Done {
                    session_id: None,
                    stats: None,
                },
            ],
        )
    }

    /// Pause before each event (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn seen_specs(&self) -> Arc<Mutex<Vec<RunSpec>>> {
        Arc::clone(&self.seen)
    }
}

impl Runner for ScriptedRunner {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn run(&self, spec: RunSpec, cancel: CancellationToken) -> EventStream {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(spec);
        }
        let events = self.events.clone();
        let delay = self.delay;
        Box::pin(async_stream::stream! {
            for event in events {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    yield Err(RunError::Cancelled);
                    return;
                }
                yield Ok(event);
            }
        })
    }
}
