//! Batch pipeline: fan delegated steps out through the scheduler and
//! summarize how they went.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument};

use crate::core::events::RunnerEvent;
use crate::delegation::{
    DelegationExecutor, DelegationResult, DelegationStatus, DelegationStep, WorktreeDelegation,
    delegate,
};
use crate::error::ConfigError;
use crate::io::config::SchedulerConfig;
use crate::scheduler::TaskQueue;

/// One step's outcome within a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEntry {
    pub step_id: String,
    pub status: DelegationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    pub tool_calls: u32,
    pub error_events: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl BatchEntry {
    pub fn from_result(step_id: &str, result: &DelegationResult, latency_ms: u64) -> Self {
        let tool_calls = result
            .events
            .iter()
            .filter(|e| matches!(e, RunnerEvent::ToolCall { .. }))
            .count();
        let error_events = result.events.iter().filter(|e| e.is_error()).count();
        Self {
            step_id: step_id.to_string(),
            status: result.status,
            error: result.error.clone(),
            latency_ms,
            engine: result.engine.clone(),
            tool_calls: u32::try_from(tool_calls).unwrap_or(u32::MAX),
            error_events: u32::try_from(error_events).unwrap_or(u32::MAX),
            warnings: result.warnings.clone(),
        }
    }

    /// Entry for a step that never produced a result (prepare failure, panic, cancel).
    pub fn unfinished(step_id: &str, status: DelegationStatus, error: String) -> Self {
        Self {
            step_id: step_id.to_string(),
            status,
            error: Some(error),
            latency_ms: 0,
            engine: None,
            tool_calls: 0,
            error_events: 0,
            warnings: Vec::new(),
        }
    }
}

/// Aggregate handed to the policy evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub runs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    /// `succeeded / runs`, 0 for an empty batch.
    pub success_rate: f64,
    /// Latency per run in milliseconds, in step order.
    pub latency_ms: Vec<u64>,
    /// Runs per engine.
    pub engines: BTreeMap<String, usize>,
    pub tool_calls: u64,
    pub error_events: u64,
}

impl BatchStats {
    pub fn from_entries(entries: &[BatchEntry]) -> Self {
        let mut stats = Self {
            runs: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            match entry.status {
                DelegationStatus::Completed => stats.succeeded += 1,
                DelegationStatus::Failed => stats.failed += 1,
                DelegationStatus::Aborted => stats.aborted += 1,
            }
            stats.latency_ms.push(entry.latency_ms);
            if let Some(engine) = &entry.engine {
                *stats.engines.entry(engine.clone()).or_default() += 1;
            }
            stats.tool_calls += u64::from(entry.tool_calls);
            stats.error_events += u64::from(entry.error_events);
        }
        if stats.runs > 0 {
            stats.success_rate = stats.succeeded as f64 / stats.runs as f64;
        }
        stats
    }

    pub fn max_latency_ms(&self) -> Option<u64> {
        self.latency_ms.iter().copied().max()
    }
}

/// External policy check over a finished batch. Returns violation messages.
pub trait PolicyEvaluator {
    fn evaluate(&self, stats: &BatchStats) -> Vec<String>;
}

impl<F> PolicyEvaluator for F
where
    F: Fn(&BatchStats) -> Vec<String>,
{
    fn evaluate(&self, stats: &BatchStats) -> Vec<String> {
        self(stats)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
    pub stats: BatchStats,
}

impl BatchReport {
    pub fn evaluate(&self, policy: &dyn PolicyEvaluator) -> Vec<String> {
        policy.evaluate(&self.stats)
    }
}

/// Queue sized by the `[scheduler]` config section.
pub fn batch_queue(cfg: &SchedulerConfig) -> Result<TaskQueue<BatchEntry>, ConfigError> {
    TaskQueue::new(cfg.max_concurrency)
}

/// Run every step through `delegate` on `queue`; entries come back in step order.
#[instrument(skip_all, fields(steps = steps.len()))]
pub async fn run_batch(
    queue: &TaskQueue<BatchEntry>,
    delegation: Arc<WorktreeDelegation>,
    executor: Arc<dyn DelegationExecutor>,
    steps: Vec<DelegationStep>,
) -> BatchReport {
    let handles: Vec<_> = steps
        .into_iter()
        .map(|step| {
            let delegation = Arc::clone(&delegation);
            let executor = Arc::clone(&executor);
            let step_id = step.id.clone();
            let handle = queue.push(move |cancel| async move {
                let started = Instant::now();
                let result = delegate(&delegation, &step, executor.as_ref(), cancel).await?;
                let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                Ok(BatchEntry::from_result(&step.id, &result, latency_ms))
            });
            (step_id, handle)
        })
        .collect();

    let mut entries = Vec::with_capacity(handles.len());
    for (step_id, handle) in handles {
        let token = handle.token();
        let entry = match handle.await {
            Ok(entry) => entry,
            Err(err) => {
                let status = if token.is_cancelled() {
                    DelegationStatus::Aborted
                } else {
                    DelegationStatus::Failed
                };
                BatchEntry::unfinished(&step_id, status, format!("{err:#}"))
            }
        };
        entries.push(entry);
    }
    let stats = BatchStats::from_entries(&entries);
    info!(
        runs = stats.runs,
        succeeded = stats.succeeded,
        failed = stats.failed,
        aborted = stats.aborted,
        "batch finished"
    );
    BatchReport { entries, stats }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: DelegationStatus, latency_ms: u64, engine: Option<&str>) -> BatchEntry {
        BatchEntry {
            step_id: "s".to_string(),
            status,
            error: None,
            latency_ms,
            engine: engine.map(str::to_string),
            tool_calls: 2,
            error_events: u32::from(status != DelegationStatus::Completed),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn aggregates_outcomes() {
        let entries = vec![
            entry(DelegationStatus::Completed, 10, Some("a")),
            entry(DelegationStatus::Completed, 30, Some("a")),
            entry(DelegationStatus::Failed, 20, Some("b")),
            entry(DelegationStatus::Aborted, 5, None),
        ];
        let stats = BatchStats::from_entries(&entries);
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.aborted, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.latency_ms, vec![10, 30, 20, 5]);
        assert_eq!(stats.max_latency_ms(), Some(30));
        assert_eq!(stats.engines.get("a"), Some(&2));
        assert_eq!(stats.tool_calls, 8);
        assert_eq!(stats.error_events, 2);
    }

    #[test]
    fn queue_follows_scheduler_config() {
        let queue = batch_queue(&SchedulerConfig { max_concurrency: 2 }).expect("queue");
        assert_eq!(queue.max_concurrency(), 2);

        let err = batch_queue(&SchedulerConfig { max_concurrency: 0 }).unwrap_err();
        assert_eq!(err, ConfigError::InvalidConcurrency(0));
    }

    #[test]
    fn empty_batch_has_zero_rate() {
        let stats = BatchStats::from_entries(&[]);
        assert_eq!(stats.runs, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.max_latency_ms(), None);
    }

    #[test]
    fn closures_act_as_policy_evaluators() {
        let policy = |stats: &BatchStats| {
            if stats.success_rate < 0.9 {
                vec![format!("success rate {:.2} below 0.90", stats.success_rate)]
            } else {
                Vec::new()
            }
        };
        let report = BatchReport {
            entries: Vec::new(),
            stats: BatchStats::from_entries(&[
                entry(DelegationStatus::Completed, 1, None),
                entry(DelegationStatus::Failed, 1, None),
            ]),
        };
        assert_eq!(report.evaluate(&policy), vec!["success rate 0.50 below 0.90"]);
    }

    #[test]
    fn counts_tool_calls_and_errors_from_events() {
        let mut result = DelegationResult::failed("bad");
        result.events = vec![
            RunnerEvent::ToolCall {
                name: "read".to_string(),
                arguments: serde_json::Value::Null,
            },
            RunnerEvent::error("bad", None, None),
            RunnerEvent::Done {
                session_id: None,
                stats: None,
            },
        ];
        let entry = BatchEntry::from_result("s1", &result, 12);
        assert_eq!(entry.tool_calls, 1);
        assert_eq!(entry.error_events, 1);
        assert_eq!(entry.status, DelegationStatus::Failed);
    }
}
