//! Runner abstraction for pluggable execution backends.
//!
//! The [`Runner`] trait decouples orchestration from the engine that does the
//! work. Every runner turns a validated [`RunSpec`] into a lazy, ordered,
//! finite [`EventStream`] ending in exactly one `done` event, or in
//! [`RunError::Cancelled`] when the caller's token fires first. Tests use
//! scripted runners that replay fixed event sequences.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::events::RunnerEvent;
use crate::core::spec::RunSpec;
use crate::error::RunError;

pub mod command;

pub use command::CommandRunner;

/// Single-pass stream of a run's events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RunnerEvent, RunError>> + Send>>;

/// Abstraction over execution backends.
pub trait Runner: Send + Sync {
    /// Engine id this runner is registered under.
    fn engine(&self) -> &str;

    /// Start a run. Nothing happens until the stream is polled.
    fn run(&self, spec: RunSpec, cancel: CancellationToken) -> EventStream;
}

/// Runners keyed by engine id.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<dyn Runner>>,
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("engines", &self.engines())
            .finish()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under its engine id, returning any runner it replaced.
    pub fn register(&mut self, runner: Arc<dyn Runner>) -> Option<Arc<dyn Runner>> {
        let engine = runner.engine().to_string();
        debug!(engine = %engine, "registering runner");
        self.runners.insert(engine, runner)
    }

    pub fn get(&self, engine: &str) -> Result<Arc<dyn Runner>, RunError> {
        self.runners
            .get(engine)
            .cloned()
            .ok_or_else(|| RunError::UnknownEngine(engine.to_string()))
    }

    pub fn engines(&self) -> Vec<&str> {
        self.runners.keys().map(String::as_str).collect()
    }

    /// Dispatch to the runner for `spec.engine()`.
    pub fn run(&self, spec: RunSpec, cancel: CancellationToken) -> Result<EventStream, RunError> {
        let runner = self.get(spec.engine())?;
        Ok(runner.run(spec, cancel))
    }
}

/// Drain a stream, stopping at the first error.
pub async fn collect_events(mut stream: EventStream) -> Result<Vec<RunnerEvent>, RunError> {
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        events.push(item?);
    }
    Ok(events)
}
