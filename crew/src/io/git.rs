//! Git adapter for worktree management.
//!
//! Every call is a bounded `git` subprocess run from a fixed working
//! directory. Git's own worktree locking is the final arbiter when several
//! processes share one repository.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::{CommandOutput, run_command_with_timeout};

pub const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const GIT_OUTPUT_LIMIT_BYTES: usize = 4_000_000;

/// One record from `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Full ref name (`refs/heads/...`) when a branch is checked out.
    pub branch: Option<String>,
    pub detached: bool,
    pub bare: bool,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub prunable: bool,
    pub prunable_reason: Option<String>,
}

/// Options for `git worktree add`.
#[derive(Debug, Clone)]
pub struct AddWorktree<'a> {
    pub path: &'a Path,
    pub base: &'a str,
    /// New branch to create; `None` checks out `base` detached.
    pub branch: Option<&'a str>,
    pub no_checkout: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Absolute path of the repository's main working tree.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.success())
    }

    /// Resolve a revision to an abbreviated sha.
    pub fn short_sha(&self, rev: &str, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all, fields(path = %req.path.display(), base = req.base, branch = ?req.branch))]
    pub fn worktree_add(&self, req: &AddWorktree<'_>) -> Result<()> {
        let path = req.path.to_string_lossy();
        let mut args = vec!["worktree", "add"];
        match req.branch {
            Some(branch) => args.extend(["-b", branch]),
            None => args.push("--detach"),
        }
        if req.no_checkout {
            args.push("--no-checkout");
        }
        args.extend([&*path, req.base]);
        debug!("adding worktree");
        self.run_checked(&args)?;
        Ok(())
    }

    /// Remove a worktree. `force` discards local changes and overrides a git lock.
    #[instrument(skip_all, fields(path = %path.display(), force = force))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.extend(["--force", "--force"]);
        }
        args.push(&*path);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn worktree_lock(&self, path: &Path, reason: Option<&str>) -> Result<()> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "lock"];
        if let Some(reason) = reason {
            args.extend(["--reason", reason]);
        }
        args.push(&*path);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn worktree_unlock(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "unlock", &*path])?;
        Ok(())
    }

    /// Prune stale administrative records. `expire` uses git's date syntax.
    #[instrument(skip_all, fields(expire = ?expire))]
    pub fn worktree_prune(&self, expire: Option<&str>) -> Result<()> {
        let mut args = vec!["worktree", "prune"];
        if let Some(expire) = expire {
            args.extend(["--expire", expire]);
        }
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn worktree_repair(&self) -> Result<()> {
        self.run_checked(&["worktree", "repair"])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&out))
    }

    /// Delete a local branch; `force` deletes even when unmerged.
    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {:?}",
                args.join(" "),
                GIT_TIMEOUT
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, GIT_TIMEOUT, GIT_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            entries.extend(current.take());
            continue;
        }
        let (key, value) = match line.split_once(' ') {
            Some((key, value)) => (key, Some(value)),
            None => (line, None),
        };
        if key == "worktree" {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(value.unwrap_or_default()),
                ..WorktreeEntry::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => entry.head = value.map(str::to_string),
            "branch" => entry.branch = value.map(str::to_string),
            "detached" => entry.detached = true,
            "bare" => entry.bare = true,
            "locked" => {
                entry.locked = true;
                entry.lock_reason = value.map(str::to_string);
            }
            "prunable" => {
                entry.prunable = true;
                entry.prunable_reason = value.map(str::to_string);
            }
            _ => {}
        }
    }
    entries.extend(current);
    entries
}
