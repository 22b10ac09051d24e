//! Delegation lifecycle: give a step its own worktree, run it, release it.
//!
//! [`WorktreeDelegation::prepare`] allocates an isolated worktree for a step,
//! a [`DelegationExecutor`] does the work inside it, and
//! [`WorktreeDelegation::finalize`] keeps or removes the worktree according
//! to the outcome. Cleanup problems never change the outcome; they are
//! attached to the result as warnings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::events::{RunStats, RunnerEvent};
use crate::core::naming::delegated_run_id;
use crate::core::spec::RunSpec;
use crate::error::{RunError, WorktreeError};
use crate::io::workspace::random_suffix;
use crate::io::worktree::{CreateWorktree, WorktreeManager};
use crate::runner::RunnerRegistry;

pub const WORKTREE_PATH_ENV: &str = "CREW_WORKTREE_PATH";
pub const WORKTREE_ID_ENV: &str = "CREW_WORKTREE_ID";
pub const RUN_ID_ENV: &str = "CREW_RUN_ID";

/// A unit of work handed to the lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegationStep {
    pub id: String,
    /// Task label for the worktree name. Defaults to the step id.
    #[serde(default)]
    pub task: Option<String>,
    /// Base revision. Defaults to the policy's base.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DelegationStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Retention policy applied by [`WorktreeDelegation::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationPolicy {
    pub keep_on_success: bool,
    pub keep_on_failure: bool,
    pub base: String,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        Self {
            keep_on_success: false,
            keep_on_failure: false,
            base: "HEAD".to_string(),
        }
    }
}

/// Where and how a prepared step should run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegationContext {
    pub step_id: String,
    pub run_id: String,
    pub worktree_id: String,
    pub worktree_path: PathBuf,
    /// Variables the executor must hand to any process it spawns.
    pub env: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegationResult {
    pub status: DelegationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Engine that did the work, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<RunnerEvent>,
}

impl DelegationResult {
    fn with_status(status: DelegationStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            warnings: Vec::new(),
            engine: None,
            stats: None,
            events: Vec::new(),
        }
    }

    pub fn completed() -> Self {
        Self::with_status(DelegationStatus::Completed, None)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::with_status(DelegationStatus::Failed, Some(error.into()))
    }

    pub fn aborted(error: impl Into<String>) -> Self {
        Self::with_status(DelegationStatus::Aborted, Some(error.into()))
    }

    pub fn is_completed(&self) -> bool {
        self.status == DelegationStatus::Completed
    }
}

/// Backend-agnostic work performed inside a prepared worktree.
pub trait DelegationExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        context: &'a DelegationContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, DelegationResult>;
}

/// Allocates and releases worktrees for delegated steps.
#[derive(Debug, Clone)]
pub struct WorktreeDelegation {
    manager: Arc<WorktreeManager>,
    policy: DelegationPolicy,
}

impl WorktreeDelegation {
    pub fn new(manager: Arc<WorktreeManager>, policy: DelegationPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn manager(&self) -> &Arc<WorktreeManager> {
        &self.manager
    }

    pub fn policy(&self) -> &DelegationPolicy {
        &self.policy
    }

    /// Create the step's worktree and describe how to run inside it.
    #[instrument(skip_all, fields(step = %step.id))]
    pub async fn prepare(&self, step: &DelegationStep) -> Result<DelegationContext, WorktreeError> {
        let run_id = delegated_run_id(&step.id, &random_suffix());
        let request = CreateWorktree {
            run_id: run_id.clone(),
            task: Some(step.task.clone().unwrap_or_else(|| step.id.clone())),
            base: step.base.clone().unwrap_or_else(|| self.policy.base.clone()),
            ..CreateWorktree::default()
        };
        let manager = Arc::clone(&self.manager);
        let state = tokio::task::spawn_blocking(move || manager.create(request))
            .await
            .map_err(|err| WorktreeError::Other(anyhow!("worktree create task failed: {err}")))??;

        let env = BTreeMap::from([
            (
                WORKTREE_PATH_ENV.to_string(),
                state.path.to_string_lossy().into_owned(),
            ),
            (WORKTREE_ID_ENV.to_string(), state.id.clone()),
            (RUN_ID_ENV.to_string(), run_id.clone()),
        ]);
        info!(worktree = %state.id, run_id = %run_id, "delegation prepared");
        Ok(DelegationContext {
            step_id: step.id.clone(),
            run_id,
            worktree_id: state.id,
            worktree_path: state.path,
            env,
            metadata: step.metadata.clone(),
        })
    }

    /// Apply the retention policy. Never changes the result's status.
    #[instrument(skip_all, fields(step = %step.id, worktree = %context.worktree_id))]
    pub async fn finalize(
        &self,
        step: &DelegationStep,
        context: &DelegationContext,
        mut result: DelegationResult,
    ) -> DelegationResult {
        let keep = if result.is_completed() {
            self.policy.keep_on_success
        } else {
            self.policy.keep_on_failure
        };
        if keep {
            info!(status = ?result.status, path = %context.worktree_path.display(), "keeping worktree");
            return result;
        }

        let manager = Arc::clone(&self.manager);
        let id = context.worktree_id.clone();
        let outcome = tokio::task::spawn_blocking(move || manager.remove(&id, true)).await;
        let failure = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(err) => Some(format!("cleanup task failed: {err}")),
        };
        if let Some(detail) = failure {
            warn!(step = %step.id, "worktree cleanup failed");
            debug!(detail = %detail, "worktree cleanup failure detail");
            result.warnings.push(format!(
                "failed to remove worktree {}: {detail}",
                context.worktree_id
            ));
        }
        result
    }
}

/// Prepare, execute and finalize one step.
pub async fn delegate(
    delegation: &WorktreeDelegation,
    step: &DelegationStep,
    executor: &dyn DelegationExecutor,
    cancel: CancellationToken,
) -> Result<DelegationResult, WorktreeError> {
    let context = delegation.prepare(step).await?;
    let result = executor.execute(&context, cancel).await;
    Ok(delegation.finalize(step, &context, result).await)
}

/// Runs a [`RunSpec`] through the registry with the worktree as its root.
#[derive(Debug, Clone)]
pub struct RunnerExecutor {
    registry: RunnerRegistry,
    spec: RunSpec,
}

impl RunnerExecutor {
    pub fn new(registry: RunnerRegistry, spec: RunSpec) -> Self {
        Self { registry, spec }
    }

    async fn run(&self, context: &DelegationContext, cancel: CancellationToken) -> DelegationResult {
        let spec = self
            .spec
            .with_repo_root(&context.worktree_path)
            .with_env(context.env.clone());
        let engine = spec.engine().to_string();
        let mut stream = match self.registry.run(spec, cancel) {
            Ok(stream) => stream,
            Err(err) => return DelegationResult::failed(err.to_string()),
        };

        let mut events = Vec::new();
        let mut interrupted = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => events.push(event),
                Err(err) => {
                    interrupted = Some(err);
                    break;
                }
            }
        }

        let mut result = match interrupted {
            Some(RunError::Cancelled) => DelegationResult::aborted(RunError::Cancelled.to_string()),
            Some(err) => DelegationResult::failed(err.to_string()),
            None => match events.iter().rev().find(|e| e.is_error()) {
                Some(RunnerEvent::Error { message, .. }) => DelegationResult::failed(message.clone()),
                _ => DelegationResult::completed(),
            },
        };
        result.stats = events.iter().rev().find_map(|event| match event {
            RunnerEvent::Done { stats, .. } => stats.clone(),
            _ => None,
        });
        result.engine = Some(engine);
        result.events = events;
        result
    }
}

impl DelegationExecutor for RunnerExecutor {
    fn execute<'a>(
        &'a self,
        context: &'a DelegationContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, DelegationResult> {
        Box::pin(self.run(context, cancel))
    }
}
