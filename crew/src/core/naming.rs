//! Deterministic names for managed worktrees and their branches.
//!
//! A worktree for run `r` and task `t` lives in directory `wt-<r>-<slug(t)>`
//! on branch `wt/<r>/<slug(t)>`.

use anyhow::{Result, bail};

/// Directory prefix marking a worktree as managed.
pub const WORKTREE_PREFIX: &str = "wt-";
/// Branch namespace for managed worktrees.
pub const BRANCH_PREFIX: &str = "wt/";
/// Task label used when the caller does not provide one.
pub const DEFAULT_TASK: &str = "task";

const MAX_SLUG_LEN: usize = 48;
const MAX_RUN_ID_LEN: usize = 64;

/// Lowercase a label and collapse anything outside `[a-z0-9]` into single dashes.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut pending_dash = false;
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    if slug.is_empty() {
        return DEFAULT_TASK.to_string();
    }
    slug
}

/// Validate a caller-provided run id for use in paths and ref names.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() {
        bail!("run id must not be empty");
    }
    if run_id.len() > MAX_RUN_ID_LEN {
        bail!("run id '{run_id}' is longer than {MAX_RUN_ID_LEN} characters");
    }
    if run_id.starts_with(['-', '.']) {
        bail!("run id '{run_id}' must not start with '-' or '.'");
    }
    if run_id.contains("..") || run_id.ends_with(".lock") {
        bail!("run id '{run_id}' is not a valid ref component");
    }
    if let Some(bad) = run_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        bail!("run id '{run_id}' contains invalid character '{bad}'");
    }
    Ok(())
}

/// Worktree directory name (also the worktree id).
pub fn worktree_id(run_id: &str, task: &str) -> String {
    format!("{WORKTREE_PREFIX}{run_id}-{}", slugify(task))
}

/// Branch created for a non-detached worktree.
pub fn branch_name(run_id: &str, task: &str) -> String {
    format!("{BRANCH_PREFIX}{run_id}/{}", slugify(task))
}

/// Run id for a delegated step: `<slug(step)>-<suffix>`.
pub fn delegated_run_id(step_id: &str, suffix: &str) -> String {
    format!("{}-{suffix}", slugify(step_id))
}

/// Strip `refs/heads/` from a full ref name.
pub fn short_branch(full_ref: &str) -> &str {
    full_ref.strip_prefix("refs/heads/").unwrap_or(full_ref)
}

/// True for directory names the manager owns.
pub fn is_managed_name(name: &str) -> bool {
    name.starts_with(WORKTREE_PREFIX) && name.len() > WORKTREE_PREFIX.len()
}
