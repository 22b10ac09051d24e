//! Crew configuration: a TOML file layered with `CREW_*` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ttl::parse_ttl;
use crate::io::atomic::write_atomic;

/// Default config file location, relative to the repository root.
pub const DEFAULT_CONFIG_PATH: &str = ".crew/config.toml";

/// Top-level configuration (TOML).
///
/// Missing fields fall back to defaults so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CrewConfig {
    pub worktrees: WorktreeConfig,
    pub scheduler: SchedulerConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Directory holding managed worktrees and their sidecars.
    /// Relative paths resolve against the repository root.
    pub root: PathBuf,

    /// Maximum number of managed worktrees alive at once.
    pub max_concurrency: usize,

    /// Default expiry for `gc` (`30s`, `15m`, `12h`, `7d`, `2w`).
    pub ttl: String,

    /// Allow `--force` to remove locked worktrees.
    pub allow_force: bool,

    /// Bases that may not be checked out detached.
    pub protected_branches: Vec<String>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".worktrees"),
            max_concurrency: 8,
            ttl: "14d".to_string(),
            allow_force: false,
            protected_branches: vec!["main".to_string(), "master".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Base directory for per-run workspaces. Defaults to the system temp dir.
    pub base_dir: Option<PathBuf>,

    /// Resource sampling interval in milliseconds.
    pub sample_interval_ms: u64,

    /// Retain workspaces after finalize.
    pub keep: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            sample_interval_ms: 500,
            keep: false,
        }
    }
}

impl CrewConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worktrees.max_concurrency == 0 {
            return Err(anyhow!("worktrees.max_concurrency must be > 0"));
        }
        parse_ttl(&self.worktrees.ttl).context("worktrees.ttl")?;
        if self.worktrees.root.as_os_str().is_empty() {
            return Err(anyhow!("worktrees.root must not be empty"));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(anyhow!("scheduler.max_concurrency must be > 0"));
        }
        if self.workspace.sample_interval_ms == 0 {
            return Err(anyhow!("workspace.sample_interval_ms must be > 0"));
        }
        Ok(())
    }

    /// Apply `CREW_*` overrides read through `lookup` (usually `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("CREW_WT_ROOT") {
            self.worktrees.root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("CREW_WT_MAX_CONCURRENCY") {
            self.worktrees.max_concurrency = parse_env("CREW_WT_MAX_CONCURRENCY", &raw)?;
        }
        if let Some(ttl) = lookup("CREW_WT_TTL") {
            self.worktrees.ttl = ttl;
        }
        if let Some(raw) = lookup("CREW_WT_ALLOW_FORCE") {
            self.worktrees.allow_force = parse_flag(&raw);
        }
        if let Some(raw) = lookup("CREW_MAX_CONCURRENCY") {
            self.scheduler.max_concurrency = parse_env("CREW_MAX_CONCURRENCY", &raw)?;
        }
        if let Some(dir) = lookup("CREW_WORKSPACE_ROOT") {
            self.workspace.base_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup("CREW_SAMPLE_INTERVAL_MS") {
            self.workspace.sample_interval_ms = parse_env("CREW_SAMPLE_INTERVAL_MS", &raw)?;
        }
        Ok(())
    }

    /// Worktree root resolved against `repo_root` when relative.
    pub fn worktree_root(&self, repo_root: &Path) -> PathBuf {
        if self.worktrees.root.is_absolute() {
            self.worktrees.root.clone()
        } else {
            repo_root.join(&self.worktrees.root)
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("invalid {name}='{raw}': {err}"))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CrewConfig::default()`.
pub fn load_config(path: &Path) -> Result<CrewConfig> {
    if !path.exists() {
        let cfg = CrewConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CrewConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load the file, then layer process environment overrides on top.
pub fn load_config_with_env(path: &Path) -> Result<CrewConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
    cfg.validate()?;
    debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CrewConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
