//! Sidecar metadata persisted next to each managed worktree.
//!
//! Layout: the worktree lives at `<root>/<id>/` and its sidecar at
//! `<root>/<id>.json`. The sidecar is the durable record of who owns the
//! worktree and whether it is locked; it is removed together with the
//! worktree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::naming::is_managed_name;
use crate::io::atomic::write_atomic;

/// Current sidecar schema. Bumped on incompatible changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Advisory lock recorded in the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockState {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeMetadata {
    pub schema_version: u32,
    pub id: String,
    pub run_id: String,
    pub task: String,
    pub base: String,
    /// Short branch name; `None` for detached worktrees.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub short_sha: Option<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub no_checkout: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lock: LockState,
}

impl WorktreeMetadata {
    /// Set the lock and bump `updated_at`.
    pub fn set_locked(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        self.lock = LockState {
            locked: true,
            reason,
            locked_at: Some(now),
        };
        self.updated_at = now;
    }

    pub fn clear_lock(&mut self, now: DateTime<Utc>) {
        self.lock = LockState::default();
        self.updated_at = now;
    }
}

/// Sidecar path for a worktree id under `root`.
pub fn sidecar_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("{id}.json"))
}

/// Load a sidecar. Missing files yield `Ok(None)`.
pub fn load_metadata(path: &Path) -> Result<Option<WorktreeMetadata>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let meta: WorktreeMetadata =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if meta.schema_version > SCHEMA_VERSION {
        bail!(
            "{} has schema_version {} (newest supported is {SCHEMA_VERSION})",
            path.display(),
            meta.schema_version
        );
    }
    Ok(Some(meta))
}

/// Atomically write a sidecar.
pub fn write_metadata(path: &Path, meta: &WorktreeMetadata) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(meta).context("serialize worktree metadata")?;
    payload.push('\n');
    write_atomic(path, &payload)?;
    debug!(path = %path.display(), "wrote worktree metadata");
    Ok(())
}

/// Delete a sidecar. Returns `false` if it was already gone.
pub fn remove_metadata(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Ids of every managed sidecar under `root`, sorted.
pub fn list_sidecar_ids(root: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", root.display())),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(id) = name.strip_suffix(".json")
            && is_managed_name(id)
            && entry.file_type().is_ok_and(|t| t.is_file())
        {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}
