//! Side-effecting helpers: filesystem, git, child processes.

pub mod atomic;
pub mod config;
pub mod git;
pub mod metadata;
pub mod process;
pub mod sampler;
pub mod workspace;
pub mod worktree;
