//! Managed git worktrees: one isolated, lockable checkout per task.
//!
//! State lives on disk only. `git worktree list` says which checkouts exist;
//! the sidecar next to each one (see [`crate::io::metadata`]) says who owns
//! it and whether it is locked. A fresh manager rebuilds everything from
//! those two sources, and [`WorktreeManager::reconcile`] repairs any drift
//! between them after a crash.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::core::naming::{
    BRANCH_PREFIX, DEFAULT_TASK, WORKTREE_PREFIX, branch_name, is_managed_name, short_branch,
    slugify, validate_run_id, worktree_id,
};
use crate::core::ttl::{git_expire_arg, parse_ttl};
use crate::error::WorktreeError;
use crate::io::config::CrewConfig;
use crate::io::git::{AddWorktree, Git, WorktreeEntry};
use crate::io::metadata::{
    LockState, SCHEMA_VERSION, WorktreeMetadata, list_sidecar_ids, load_metadata,
    remove_metadata, sidecar_path, write_metadata,
};

type WtResult<T> = Result<T, WorktreeError>;

const EVENT_CAPACITY: usize = 256;
const SHORT_SHA_LEN: usize = 7;

/// Manager settings, usually derived from [`CrewConfig`].
#[derive(Debug, Clone)]
pub struct WorktreeSettings {
    pub root: PathBuf,
    pub max_concurrency: usize,
    pub ttl: Duration,
    pub ttl_spec: String,
    pub allow_force: bool,
    pub protected_branches: Vec<String>,
}

impl WorktreeSettings {
    pub fn from_config(cfg: &CrewConfig, repo_root: &Path) -> anyhow::Result<Self> {
        let ttl = parse_ttl(&cfg.worktrees.ttl).context("worktrees.ttl")?;
        Ok(Self {
            root: cfg.worktree_root(repo_root),
            max_concurrency: cfg.worktrees.max_concurrency,
            ttl,
            ttl_spec: cfg.worktrees.ttl.clone(),
            allow_force: cfg.worktrees.allow_force,
            protected_branches: cfg.worktrees.protected_branches.clone(),
        })
    }
}

/// Parameters for [`WorktreeManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateWorktree {
    pub run_id: String,
    pub task: Option<String>,
    pub base: String,
    pub detach: bool,
    pub no_checkout: bool,
    pub lock: bool,
    pub lock_reason: Option<String>,
}

/// Merged view of one managed worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeState {
    pub id: String,
    pub path: PathBuf,
    pub run_id: String,
    pub task: String,
    pub base: Option<String>,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub short_sha: Option<String>,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub detached: bool,
    pub no_checkout: bool,
    pub prunable: bool,
    pub prunable_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeEventKind {
    Create,
    Remove,
    Lock,
    Unlock,
    Prune,
    Repair,
}

impl WorktreeEventKind {
    pub fn name(self) -> &'static str {
        match self {
            WorktreeEventKind::Create => "worktree.create",
            WorktreeEventKind::Remove => "worktree.remove",
            WorktreeEventKind::Lock => "worktree.lock",
            WorktreeEventKind::Unlock => "worktree.unlock",
            WorktreeEventKind::Prune => "worktree.prune",
            WorktreeEventKind::Repair => "worktree.repair",
        }
    }
}

/// Notification published after every successful mutation.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeEvent {
    pub kind: WorktreeEventKind,
    pub name: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Sidecars synthesized for worktrees git knows about.
    pub restored: Vec<String>,
    /// Sidecars deleted because their worktree is gone.
    pub orphaned: Vec<String>,
}

/// Outcome of a garbage-collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub removed: Vec<String>,
    pub expire: String,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    git: Git,
    settings: WorktreeSettings,
    mutate: Mutex<()>,
    events: broadcast::Sender<WorktreeEvent>,
}

impl WorktreeManager {
    /// Open a manager for the repository containing `repo_dir`.
    ///
    /// Creates the worktree root if needed. Relative roots resolve against
    /// the repository's top level.
    pub fn new(repo_dir: &Path, mut settings: WorktreeSettings) -> anyhow::Result<Self> {
        if settings.max_concurrency == 0 {
            return Err(anyhow!("worktree max_concurrency must be > 0"));
        }
        let repo_root = Git::new(repo_dir)
            .toplevel()
            .with_context(|| format!("{} is not inside a git repository", repo_dir.display()))?;
        if settings.root.is_relative() {
            settings.root = repo_root.join(&settings.root);
        }
        fs::create_dir_all(&settings.root)
            .with_context(|| format!("create worktree root {}", settings.root.display()))?;
        settings.root = settings
            .root
            .canonicalize()
            .with_context(|| format!("canonicalize {}", settings.root.display()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        debug!(repo = %repo_root.display(), root = %settings.root.display(), "worktree manager ready");
        Ok(Self {
            git: Git::new(&repo_root),
            repo_root,
            settings,
            mutate: Mutex::new(()),
            events,
        })
    }

    pub fn from_config(repo_dir: &Path, cfg: &CrewConfig) -> anyhow::Result<Self> {
        let repo_root = Git::new(repo_dir).toplevel()?;
        Self::new(&repo_root, WorktreeSettings::from_config(cfg, &repo_root)?)
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }

    pub fn settings(&self) -> &WorktreeSettings {
        &self.settings
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorktreeEvent> {
        self.events.subscribe()
    }

    #[instrument(skip_all, fields(run_id = %req.run_id, base = %req.base, detach = req.detach))]
    pub fn create(&self, req: CreateWorktree) -> WtResult<WorktreeState> {
        validate_run_id(&req.run_id).map_err(|e| WorktreeError::Invalid(e.to_string()))?;
        if req.base.trim().is_empty() {
            return Err(WorktreeError::Invalid("base must not be empty".to_string()));
        }
        if req.base.starts_with('-') {
            return Err(WorktreeError::Invalid(format!(
                "base '{}' must not start with '-'",
                req.base
            )));
        }
        let task = req
            .task
            .as_deref()
            .map(slugify)
            .unwrap_or_else(|| DEFAULT_TASK.to_string());
        let id = worktree_id(&req.run_id, &task);
        let path = self.settings.root.join(&id);

        let _guard = self.guard();
        let managed = self.managed()?;
        if managed.len() >= self.settings.max_concurrency {
            warn!(active = managed.len(), max = self.settings.max_concurrency, "worktree limit reached");
            return Err(WorktreeError::Limit {
                max: self.settings.max_concurrency,
            });
        }
        if path.exists() || sidecar_path(&self.settings.root, &id).exists() {
            return Err(WorktreeError::Conflict(format!("worktree '{id}' already exists")));
        }
        if let Some(existing) = managed.iter().find(|s| s.run_id == req.run_id) {
            return Err(WorktreeError::Conflict(format!(
                "run '{}' already owns worktree '{}'",
                req.run_id, existing.id
            )));
        }
        if req.detach && self.is_protected(&req.base) {
            return Err(WorktreeError::Forbidden(format!(
                "detached worktrees on protected branch '{}' are not allowed",
                req.base
            )));
        }
        let branch = (!req.detach).then(|| branch_name(&req.run_id, &task));
        if let Some(branch) = &branch
            && self.git.branch_exists(branch)?
        {
            return Err(WorktreeError::Conflict(format!("branch '{branch}' already exists")));
        }

        self.git.worktree_add(&AddWorktree {
            path: &path,
            base: &req.base,
            branch: branch.as_deref(),
            no_checkout: req.no_checkout,
        })?;

        let now = Utc::now();
        let mut meta = WorktreeMetadata {
            schema_version: SCHEMA_VERSION,
            id: id.clone(),
            run_id: req.run_id.clone(),
            task: task.clone(),
            base: req.base.clone(),
            branch: branch.clone(),
            short_sha: self.git.short_sha(&req.base, SHORT_SHA_LEN).ok(),
            detach: req.detach,
            no_checkout: req.no_checkout,
            created_at: now,
            updated_at: now,
            lock: LockState::default(),
        };
        let lock_reason = req.lock.then(|| req.lock_reason.clone()).flatten();
        let persisted = (|| -> anyhow::Result<()> {
            if req.lock {
                self.git.worktree_lock(&path, lock_reason.as_deref())?;
                meta.set_locked(lock_reason.clone(), now);
            }
            write_metadata(&sidecar_path(&self.settings.root, &id), &meta)
        })();
        if let Err(err) = persisted {
            warn!(err = %err, id = %id, "rolling back worktree after metadata failure");
            if let Err(rollback) = self.git.worktree_remove(&path, true) {
                warn!(err = %rollback, id = %id, "rollback failed");
            }
            if let Some(branch) = &branch {
                let _ = self.git.delete_branch(branch, true);
            }
            return Err(err.into());
        }

        info!(id = %id, path = %path.display(), "worktree created");
        self.emit(
            WorktreeEventKind::Create,
            json!({
                "id": id,
                "run_id": req.run_id,
                "task": task,
                "base": req.base,
                "branch": branch,
                "path": path,
                "detached": req.detach,
                "no_checkout": req.no_checkout,
            }),
        );
        if req.lock {
            self.emit(
                WorktreeEventKind::Lock,
                json!({ "id": id, "run_id": req.run_id, "locked": true, "lock_reason": lock_reason }),
            );
        }
        self.find(&id)
    }

    /// Every managed worktree, sorted by id.
    pub fn list(&self) -> WtResult<Vec<WorktreeState>> {
        self.managed()
    }

    /// Look up a worktree by id or run id.
    pub fn get(&self, key: &str) -> WtResult<WorktreeState> {
        self.find(key)
    }

    #[instrument(skip_all, fields(key = %key, force = force))]
    pub fn remove(&self, key: &str, force: bool) -> WtResult<WorktreeState> {
        let _guard = self.guard();
        let state = self.find(key)?;
        self.check_removable(&state, force)?;
        self.remove_state(&state, force)?;
        self.git.worktree_prune(None)?;
        let remaining = self.managed()?.len();
        info!(id = %state.id, force, "worktree removed");
        self.emit(
            WorktreeEventKind::Remove,
            json!({ "id": state.id, "run_id": state.run_id, "force": force }),
        );
        self.emit(WorktreeEventKind::Prune, json!({ "after": remaining }));
        Ok(state)
    }

    #[instrument(skip_all, fields(key = %key))]
    pub fn lock(&self, key: &str, reason: Option<String>) -> WtResult<WorktreeState> {
        let _guard = self.guard();
        let state = self.find(key)?;
        if state.locked {
            // Re-locking replaces the reason; git refuses to lock twice.
            let _ = self.git.worktree_unlock(&state.path);
        }
        self.git.worktree_lock(&state.path, reason.as_deref())?;
        let mut meta = self.metadata_or_synthesized(&state)?;
        meta.set_locked(reason.clone(), Utc::now());
        write_metadata(&sidecar_path(&self.settings.root, &state.id), &meta)?;
        self.emit(
            WorktreeEventKind::Lock,
            json!({ "id": state.id, "run_id": state.run_id, "locked": true, "lock_reason": reason }),
        );
        self.find(&state.id)
    }

    #[instrument(skip_all, fields(key = %key))]
    pub fn unlock(&self, key: &str) -> WtResult<WorktreeState> {
        let _guard = self.guard();
        let state = self.find(key)?;
        if let Err(err) = self.git.worktree_unlock(&state.path) {
            debug!(err = %err, id = %state.id, "git unlock skipped");
        }
        let mut meta = self.metadata_or_synthesized(&state)?;
        meta.clear_lock(Utc::now());
        write_metadata(&sidecar_path(&self.settings.root, &state.id), &meta)?;
        self.emit(
            WorktreeEventKind::Unlock,
            json!({ "id": state.id, "run_id": state.run_id, "locked": false }),
        );
        self.find(&state.id)
    }

    /// Remove unlocked worktrees older than `expire` (or the configured TTL),
    /// then prune git's stale administrative records.
    #[instrument(skip_all, fields(expire = ?expire))]
    pub fn gc(&self, expire: Option<&str>) -> WtResult<GcReport> {
        let (ttl, expire) = match expire {
            Some(spec) => (
                parse_ttl(spec).map_err(|e| WorktreeError::Invalid(e.to_string()))?,
                spec.to_string(),
            ),
            None => (self.settings.ttl, self.settings.ttl_spec.clone()),
        };
        let _guard = self.guard();
        let now = Utc::now();
        let mut report = GcReport {
            expire,
            ..GcReport::default()
        };
        for state in self.managed()? {
            if state.locked || !self.is_expired(&state, ttl, now) {
                continue;
            }
            match self.remove_state(&state, true) {
                Ok(()) => report.removed.push(state.id.clone()),
                Err(err) => {
                    warn!(err = %err, id = %state.id, "gc failed to remove worktree");
                    report.warnings.push(format!("{}: {err}", state.id));
                }
            }
        }
        self.git.worktree_prune(Some(&git_expire_arg(ttl)))?;
        let remaining = self.managed()?.len();
        info!(removed = report.removed.len(), remaining, "worktree gc finished");
        self.emit(
            WorktreeEventKind::Prune,
            json!({ "after": remaining, "removed": report.removed, "expire": report.expire }),
        );
        Ok(report)
    }

    /// Run `git worktree repair` and reconcile sidecars with git's records.
    #[instrument(skip_all)]
    pub fn repair(&self) -> WtResult<ReconcileReport> {
        let _guard = self.guard();
        self.git.worktree_repair()?;
        let report = self.reconcile_locked()?;
        self.emit(
            WorktreeEventKind::Repair,
            json!({ "status": "ok", "restored": report.restored, "orphaned": report.orphaned }),
        );
        Ok(report)
    }

    /// Rebuild sidecar state from the root directory and git after a restart.
    pub fn reconcile(&self) -> WtResult<ReconcileReport> {
        let _guard = self.guard();
        self.reconcile_locked()
    }

    fn reconcile_locked(&self) -> WtResult<ReconcileReport> {
        let entries = self.managed_entries()?;
        let mut report = ReconcileReport::default();

        for id in list_sidecar_ids(&self.settings.root)? {
            if !entries.contains_key(&id) {
                remove_metadata(&sidecar_path(&self.settings.root, &id))?;
                warn!(id = %id, "removed orphaned worktree sidecar");
                report.orphaned.push(id);
            }
        }
        for (id, entry) in &entries {
            let path = sidecar_path(&self.settings.root, id);
            if load_metadata(&path)?.is_some() {
                continue;
            }
            let meta = synthesize_metadata(id, entry, self.fallback_created_at(entry));
            write_metadata(&path, &meta)?;
            info!(id = %id, "restored missing worktree sidecar");
            report.restored.push(id.clone());
        }
        Ok(report)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.mutate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_protected(&self, base: &str) -> bool {
        let base = short_branch(base);
        self.settings.protected_branches.iter().any(|b| b == base)
    }

    fn check_removable(&self, state: &WorktreeState, force: bool) -> WtResult<()> {
        if !state.locked {
            return Ok(());
        }
        if !force {
            return Err(WorktreeError::Locked {
                id: state.id.clone(),
                reason: state.lock_reason.clone(),
            });
        }
        if !self.settings.allow_force {
            return Err(WorktreeError::Forbidden(format!(
                "force removal of locked worktree '{}' requires CREW_WT_ALLOW_FORCE=1",
                state.id
            )));
        }
        Ok(())
    }

    /// Remove the checkout, its sidecar and its branch. Caller holds the guard.
    fn remove_state(&self, state: &WorktreeState, force: bool) -> WtResult<()> {
        if state.path.exists() {
            self.git.worktree_remove(&state.path, force)?;
        }
        remove_metadata(&sidecar_path(&self.settings.root, &state.id))?;
        if let Some(branch) = state.branch.as_deref().filter(|b| b.starts_with(BRANCH_PREFIX))
            && let Err(err) = self.git.delete_branch(branch, force)
        {
            debug!(err = %err, branch, "branch kept after worktree removal");
        }
        Ok(())
    }

    fn find(&self, key: &str) -> WtResult<WorktreeState> {
        let managed = self.managed()?;
        managed
            .iter()
            .find(|s| s.id == key)
            .or_else(|| managed.iter().find(|s| s.run_id == key))
            .cloned()
            .ok_or_else(|| WorktreeError::NotFound(key.to_string()))
    }

    fn managed_entries(&self) -> WtResult<BTreeMap<String, WorktreeEntry>> {
        let mut entries = BTreeMap::new();
        for entry in self.git.worktree_list()? {
            if entry.path.parent() != Some(self.settings.root.as_path()) {
                continue;
            }
            let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_managed_name(name) {
                entries.insert(name.to_string(), entry);
            }
        }
        Ok(entries)
    }

    fn managed(&self) -> WtResult<Vec<WorktreeState>> {
        let now = Utc::now();
        let mut states = Vec::new();
        for (id, entry) in self.managed_entries()? {
            let meta = match load_metadata(&sidecar_path(&self.settings.root, &id)) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(err = %err, id = %id, "ignoring unreadable worktree sidecar");
                    None
                }
            };
            let mut state = build_state(&id, &entry, meta.as_ref());
            if state.created_at.is_none() {
                state.created_at = self.fallback_created_at(&entry);
            }
            let expired = self.is_expired(&state, self.settings.ttl, now);
            if !state.locked && (entry.prunable || expired) {
                state.prunable = true;
                if state.prunable_reason.is_none() {
                    state.prunable_reason = Some(format!("older than {}", self.settings.ttl_spec));
                }
            }
            states.push(state);
        }
        Ok(states)
    }

    fn is_expired(&self, state: &WorktreeState, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !state.path.exists() {
            return true;
        }
        let Some(created) = state.created_at else {
            return false;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        now.signed_duration_since(created) > ttl
    }

    fn fallback_created_at(&self, entry: &WorktreeEntry) -> Option<DateTime<Utc>> {
        fs::metadata(&entry.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    fn metadata_or_synthesized(&self, state: &WorktreeState) -> WtResult<WorktreeMetadata> {
        let path = sidecar_path(&self.settings.root, &state.id);
        if let Some(meta) = load_metadata(&path)? {
            return Ok(meta);
        }
        let entries = self.managed_entries()?;
        let entry = entries
            .get(&state.id)
            .ok_or_else(|| WorktreeError::NotFound(state.id.clone()))?;
        Ok(synthesize_metadata(&state.id, entry, state.created_at))
    }

    fn emit(&self, kind: WorktreeEventKind, payload: Value) {
        debug!(event = kind.name(), "worktree event");
        // No receivers is fine; events are advisory.
        let _ = self.events.send(WorktreeEvent {
            kind,
            name: kind.name().to_string(),
            payload,
            at: Utc::now(),
        });
    }
}

/// Merge a git record with its (optional) sidecar.
fn build_state(id: &str, entry: &WorktreeEntry, meta: Option<&WorktreeMetadata>) -> WorktreeState {
    let branch = entry.branch.as_deref().map(|b| short_branch(b).to_string());
    let (run_id, task) = match meta {
        Some(meta) => (meta.run_id.clone(), meta.task.clone()),
        None => derive_run_and_task(id, branch.as_deref()),
    };
    let lock = meta.map(|m| m.lock.clone()).unwrap_or_default();
    let locked = entry.locked || lock.locked;
    WorktreeState {
        id: id.to_string(),
        path: entry.path.clone(),
        run_id,
        task,
        base: meta.map(|m| m.base.clone()),
        branch,
        head: entry.head.clone(),
        short_sha: entry
            .head
            .as_deref()
            .map(|h| h.chars().take(SHORT_SHA_LEN).collect())
            .or_else(|| meta.and_then(|m| m.short_sha.clone())),
        locked,
        lock_reason: lock.reason.or_else(|| entry.lock_reason.clone()),
        locked_at: lock.locked_at,
        detached: entry.detached,
        no_checkout: meta.is_some_and(|m| m.no_checkout),
        prunable: false,
        prunable_reason: entry.prunable_reason.clone(),
        created_at: meta.map(|m| m.created_at),
        updated_at: meta.map(|m| m.updated_at),
    }
}

/// Recover run id and task from `wt/<run>/<task>`, else from the directory name.
fn derive_run_and_task(id: &str, branch: Option<&str>) -> (String, String) {
    if let Some(rest) = branch.and_then(|b| b.strip_prefix(BRANCH_PREFIX))
        && let Some((run, task)) = rest.split_once('/')
    {
        return (run.to_string(), task.to_string());
    }
    let rest = id.strip_prefix(WORKTREE_PREFIX).unwrap_or(id);
    (rest.to_string(), DEFAULT_TASK.to_string())
}

fn synthesize_metadata(
    id: &str,
    entry: &WorktreeEntry,
    created_at: Option<DateTime<Utc>>,
) -> WorktreeMetadata {
    let branch = entry.branch.as_deref().map(|b| short_branch(b).to_string());
    let (run_id, task) = derive_run_and_task(id, branch.as_deref());
    let created_at = created_at.unwrap_or_else(Utc::now);
    let head_short: Option<String> = entry
        .head
        .as_deref()
        .map(|h| h.chars().take(SHORT_SHA_LEN).collect());
    WorktreeMetadata {
        schema_version: SCHEMA_VERSION,
        id: id.to_string(),
        run_id,
        task,
        base: head_short.clone().unwrap_or_else(|| "HEAD".to_string()),
        branch,
        short_sha: head_short,
        detach: entry.detached,
        no_checkout: false,
        created_at,
        updated_at: Utc::now(),
        lock: LockState {
            locked: entry.locked,
            reason: entry.lock_reason.clone(),
            locked_at: entry.locked.then(Utc::now),
        },
    }
}
