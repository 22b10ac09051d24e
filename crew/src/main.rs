//! Crew command-line interface.
//!
//! `crew wt ...` manages isolated git worktrees for agent runs; `crew exec`
//! runs one command inside a governed workspace and streams its events as
//! JSON lines on stdout. `crew batch` fans a list of steps out over fresh
//! worktrees with bounded concurrency.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crew::batch::{batch_queue, run_batch};
use crew::core::limits::ResourceLimits;
use crew::core::spec::{RunRequest, RunSpec};
use crew::delegation::{DelegationPolicy, DelegationStep, RunnerExecutor, WorktreeDelegation};
use crew::error::{RunError, WorktreeError};
use crew::exit_codes;
use crew::io::config::{CrewConfig, DEFAULT_CONFIG_PATH, load_config_with_env, write_config};
use crew::io::workspace::WorkspaceOptions;
use crew::io::worktree::{CreateWorktree, WorktreeManager, WorktreeState};
use crew::logging;
use crew::runner::command::preview_env;
use crew::runner::{CommandRunner, Runner, RunnerRegistry};

#[derive(Parser)]
#[command(
    name = "crew",
    version,
    about = "Isolated, resource-governed agent runs over git worktrees"
)]
struct Cli {
    /// Repository to operate on (defaults to the current directory).
    #[arg(short = 'C', long, global = true)]
    repo: Option<PathBuf>,

    /// Config file (defaults to `.crew/config.toml` in the repository).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Manage isolated worktrees.
    #[command(subcommand)]
    Wt(WtCommand),
    /// Run a command in a governed workspace, streaming events as JSON lines.
    Exec(ExecArgs),
    /// Run a command once per step, each in its own worktree, and print a report.
    Batch(BatchArgs),
}

#[derive(Subcommand)]
enum WtCommand {
    /// Create a worktree for a run.
    New {
        run_id: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value = "HEAD")]
        base: String,
        #[arg(long)]
        detach: bool,
        #[arg(long)]
        no_checkout: bool,
        #[arg(long)]
        lock: bool,
        #[arg(long)]
        lock_reason: Option<String>,
    },
    /// List managed worktrees.
    Ls {
        #[arg(long)]
        json: bool,
    },
    /// Remove a worktree by run id or worktree id.
    Rm {
        run_id: String,
        #[arg(long)]
        force: bool,
    },
    Lock {
        run_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Unlock {
        run_id: String,
    },
    /// Remove expired, unlocked worktrees and prune stale records.
    Gc {
        /// Age threshold such as `12h` or `7d` (defaults to the configured TTL).
        #[arg(long)]
        expire: Option<String>,
    },
    /// Repair git's worktree records and reconcile sidecars.
    Repair,
}

#[derive(Args)]
struct ExecArgs {
    #[arg(long)]
    wall_clock_ms: Option<u64>,
    #[arg(long)]
    cpu_ms: Option<u64>,
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Keep the workspace directory afterwards.
    #[arg(long)]
    keep: bool,
    /// Stream workspace messages (attach, termination) as log events.
    #[arg(long)]
    log_workspace: bool,
    /// Command and arguments, after `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct BatchArgs {
    /// JSON array of steps (`id`, optional `task`, `base`, `metadata`).
    steps: PathBuf,
    /// Overrides `scheduler.max_concurrency`.
    #[arg(long)]
    max_concurrency: Option<usize>,
    #[arg(long, default_value = "HEAD")]
    base: String,
    #[arg(long)]
    keep_on_success: bool,
    #[arg(long)]
    keep_on_failure: bool,
    #[command(flatten)]
    exec: ExecArgs,
}

impl ExecArgs {
    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_ms: self.cpu_ms,
            memory_mb: self.memory_mb,
            wall_clock_ms: self.wall_clock_ms,
        }
    }
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            err.downcast_ref::<WorktreeError>()
                .map_or(exit_codes::INVALID, exit_codes::for_worktree_error)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config_path = cli
        .config
        .unwrap_or_else(|| repo.join(DEFAULT_CONFIG_PATH));
    match cli.command {
        Command::Init { force } => cmd_init(&config_path, force),
        Command::Wt(command) => {
            let cfg = load_config_with_env(&config_path)?;
            let manager = WorktreeManager::from_config(&repo, &cfg)?;
            cmd_wt(&manager, command)
        }
        Command::Exec(args) => {
            let cfg = load_config_with_env(&config_path)?;
            cmd_exec(&repo, &cfg, args)
        }
        Command::Batch(args) => {
            let cfg = load_config_with_env(&config_path)?;
            cmd_batch(&repo, &cfg, args)
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &CrewConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_wt(manager: &WorktreeManager, command: WtCommand) -> Result<i32> {
    match command {
        WtCommand::New {
            run_id,
            task,
            base,
            detach,
            no_checkout,
            lock,
            lock_reason,
        } => {
            let state = manager.create(CreateWorktree {
                run_id,
                task,
                base,
                detach,
                no_checkout,
                lock: lock || lock_reason.is_some(),
                lock_reason,
            })?;
            print_json(&state)?;
        }
        WtCommand::Ls { json } => {
            let states = manager.list()?;
            if json {
                print_json(&states)?;
            } else {
                print_table(&states);
            }
        }
        WtCommand::Rm { run_id, force } => print_json(&manager.remove(&run_id, force)?)?,
        WtCommand::Lock { run_id, reason } => print_json(&manager.lock(&run_id, reason)?)?,
        WtCommand::Unlock { run_id } => print_json(&manager.unlock(&run_id)?)?,
        WtCommand::Gc { expire } => print_json(&manager.gc(expire.as_deref())?)?,
        WtCommand::Repair => print_json(&manager.repair()?)?,
    }
    Ok(exit_codes::OK)
}

fn cmd_exec(repo: &Path, cfg: &CrewConfig, args: ExecArgs) -> Result<i32> {
    let (runner, spec) = literal_runner("exec", repo, cfg, &args)?;
    debug!(env = ?preview_env(&spec), "exec environment");

    runtime()?.block_on(async move {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });

        let mut stream = runner.run(spec, cancel);
        let mut failed = false;
        let stdout = std::io::stdout();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    failed |= event.is_error();
                    let mut out = stdout.lock();
                    serde_json::to_writer(&mut out, &event).context("serialize event")?;
                    writeln!(out).context("write event")?;
                }
                Err(RunError::Cancelled) => {
                    warn!("exec cancelled");
                    return Ok(exit_codes::CANCELLED);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok::<i32, anyhow::Error>(if failed {
            exit_codes::RUN_FAILED
        } else {
            exit_codes::OK
        })
    })
}

fn cmd_batch(repo: &Path, cfg: &CrewConfig, args: BatchArgs) -> Result<i32> {
    let raw = std::fs::read_to_string(&args.steps)
        .with_context(|| format!("read steps file {}", args.steps.display()))?;
    let steps: Vec<DelegationStep> = serde_json::from_str(&raw)
        .with_context(|| format!("parse steps file {}", args.steps.display()))?;

    let mut scheduler = cfg.scheduler.clone();
    if let Some(max) = args.max_concurrency {
        scheduler.max_concurrency = max;
    }
    let queue = batch_queue(&scheduler)?;

    let manager = Arc::new(WorktreeManager::from_config(repo, cfg)?);
    let delegation = Arc::new(WorktreeDelegation::new(
        manager,
        DelegationPolicy {
            keep_on_success: args.keep_on_success,
            keep_on_failure: args.keep_on_failure,
            base: args.base.clone(),
        },
    ));
    let (runner, spec) = literal_runner("batch", repo, cfg, &args.exec)?;
    let mut registry = RunnerRegistry::new();
    registry.register(Arc::new(runner));
    let executor = Arc::new(RunnerExecutor::new(registry, spec));

    runtime()?.block_on(async move {
        let interrupted = CancellationToken::new();
        let on_signal = interrupted.clone();
        let signal_queue = queue.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
                signal_queue.cancel_all(anyhow::anyhow!("interrupted"));
            }
        });

        let report = run_batch(&queue, delegation, executor, steps).await;
        print_json(&report)?;
        Ok::<i32, anyhow::Error>(if interrupted.is_cancelled() {
            exit_codes::CANCELLED
        } else if report.stats.failed + report.stats.aborted > 0 {
            exit_codes::RUN_FAILED
        } else {
            exit_codes::OK
        })
    })
}

/// Runner that passes the trailing command through verbatim, plus its spec.
fn literal_runner(
    engine: &str,
    repo: &Path,
    cfg: &CrewConfig,
    args: &ExecArgs,
) -> Result<(CommandRunner, RunSpec)> {
    let Some((program, rest)) = args.command.split_first() else {
        anyhow::bail!("missing command");
    };
    let mut request = RunRequest::new(engine, repo, args.command.join(" "));
    request.extra.limits = args.limits();
    request.extra.keep_workspace = args.keep;
    request.extra.log_workspace_messages = args.log_workspace;
    let spec = request.validate()?;

    let runner = CommandRunner::new(engine, program.clone())
        .with_literal_args(rest.iter().cloned())
        .with_workspace(WorkspaceOptions::from_config(&cfg.workspace));
    Ok((runner, spec))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn print_table(states: &[WorktreeState]) {
    println!(
        "{:<36} {:<20} {:<8} {:<8} PATH",
        "ID", "BRANCH", "LOCKED", "PRUNABLE"
    );
    for state in states {
        println!(
            "{:<36} {:<20} {:<8} {:<8} {}",
            state.id,
            state.branch.as_deref().unwrap_or("(detached)"),
            state.locked,
            state.prunable,
            state.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wt_new_with_flags() {
        let cli = Cli::parse_from([
            "crew",
            "wt",
            "new",
            "run-1",
            "--task",
            "fix parser",
            "--base",
            "base",
            "--detach",
            "--no-checkout",
            "--lock-reason",
            "review",
        ]);
        match cli.command {
            Command::Wt(WtCommand::New {
                run_id,
                task,
                base,
                detach,
                no_checkout,
                lock,
                lock_reason,
            }) => {
                assert_eq!(run_id, "run-1");
                assert_eq!(task.as_deref(), Some("fix parser"));
                assert_eq!(base, "base");
                assert!(detach && no_checkout);
                assert!(!lock);
                assert_eq!(lock_reason.as_deref(), Some("review"));
            }
            _ => panic!("expected wt new"),
        }
    }

    #[test]
    fn parse_wt_new_defaults_base_to_head() {
        let cli = Cli::parse_from(["crew", "wt", "new", "run-1"]);
        assert!(matches!(
            cli.command,
            Command::Wt(WtCommand::New { ref base, detach: false, .. }) if base == "HEAD"
        ));
    }

    #[test]
    fn parse_wt_maintenance_verbs() {
        let cli = Cli::parse_from(["crew", "wt", "ls", "--json"]);
        assert!(matches!(cli.command, Command::Wt(WtCommand::Ls { json: true })));

        let cli = Cli::parse_from(["crew", "wt", "rm", "run-1", "--force"]);
        assert!(matches!(cli.command, Command::Wt(WtCommand::Rm { force: true, .. })));

        let cli = Cli::parse_from(["crew", "wt", "lock", "run-1", "--reason", "hold"]);
        assert!(matches!(
            cli.command,
            Command::Wt(WtCommand::Lock { reason: Some(ref r), .. }) if r == "hold"
        ));

        let cli = Cli::parse_from(["crew", "wt", "unlock", "run-1"]);
        assert!(matches!(cli.command, Command::Wt(WtCommand::Unlock { .. })));

        let cli = Cli::parse_from(["crew", "wt", "gc", "--expire", "7d"]);
        assert!(matches!(
            cli.command,
            Command::Wt(WtCommand::Gc { expire: Some(ref e) }) if e == "7d"
        ));

        let cli = Cli::parse_from(["crew", "-C", "/repo", "wt", "repair"]);
        assert!(matches!(cli.command, Command::Wt(WtCommand::Repair)));
        assert_eq!(cli.repo, Some(PathBuf::from("/repo")));
    }

    #[test]
    fn parse_exec_with_limits_and_trailing_command() {
        let cli = Cli::parse_from([
            "crew",
            "exec",
            "--wall-clock-ms",
            "500",
            "--memory-mb",
            "64",
            "--keep",
            "--",
            "sh",
            "-c",
            "echo hi",
        ]);
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
        assert!(args.keep);
        assert_eq!(
            args.limits(),
            ResourceLimits {
                cpu_ms: None,
                memory_mb: Some(64),
                wall_clock_ms: Some(500),
            }
        );
    }

    #[test]
    fn parse_batch_with_overrides() {
        let cli = Cli::parse_from([
            "crew",
            "batch",
            "steps.json",
            "--max-concurrency",
            "2",
            "--keep-on-failure",
            "--wall-clock-ms",
            "1000",
            "--",
            "sh",
            "-c",
            "echo {prompt}",
        ]);
        let Command::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(args.steps, PathBuf::from("steps.json"));
        assert_eq!(args.max_concurrency, Some(2));
        assert_eq!(args.base, "HEAD");
        assert!(args.keep_on_failure && !args.keep_on_success);
        assert_eq!(args.exec.wall_clock_ms, Some(1000));
        assert_eq!(args.exec.command, vec!["sh", "-c", "echo {prompt}"]);
    }

    #[test]
    fn batch_without_concurrency_flag_uses_config() {
        let cli = Cli::parse_from(["crew", "batch", "steps.json", "--", "true"]);
        let Command::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(args.max_concurrency, None);
    }

    #[test]
    fn exec_requires_a_command() {
        assert!(Cli::try_parse_from(["crew", "exec"]).is_err());
    }
}
