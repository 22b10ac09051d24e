//! Concurrent, isolated agent execution.
//!
//! Crew runs many short-lived agent executions side by side. Each one gets
//! its own git worktree, runs under CPU, memory and wall-clock budgets, and
//! reports progress as an ordered stream of typed events. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (events, naming, budgets, masking).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process sampling,
//!   workspaces, worktrees).
//!
//! Orchestration modules ([`scheduler`], [`runner`], [`delegation`],
//! [`batch`]) compose the two into the run pipeline used by the CLI and the
//! HTTP server.

pub mod batch;
pub mod core;
pub mod delegation;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runner;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
