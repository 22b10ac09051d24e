//! Per-run sandbox directory with resource governance for one child process.
//!
//! A [`Workspace`] owns a fresh directory under a shared base. Once a child
//! process is attached, a wall-clock timer and a CPU/memory sampler watch it
//! and kill it on the first budget violation. Every message the workspace
//! emits is masked and mirrored into an audit file inside the directory.
//!
//! The directory is removed by [`Workspace::finalize`] (or on drop) unless
//! the workspace was created with `keep`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::core::events::{LogLevel, RunnerEvent};
use crate::core::limits::{CpuBudget, ResourceLimits, Violation};
use crate::core::mask::mask_sensitive;
use crate::io::config;
use crate::io::sampler::{ProcessSampler, default_sampler};

/// Environment variable pointing a child process at its workspace.
pub const WORKSPACE_ENV: &str = "CREW_WORKSPACE";
/// Audit trail file kept inside each workspace.
pub const AUDIT_FILE: &str = ".crew-audit.log";

const DEFAULT_PREFIX: &str = "crew";

/// Destination for workspace messages (already masked).
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "crew::workspace", "{message}"),
            LogLevel::Info => info!(target: "crew::workspace", "{message}"),
            LogLevel::Warn => warn!(target: "crew::workspace", "{message}"),
            LogLevel::Error => error!(target: "crew::workspace", "{message}"),
        }
    }
}

/// Forwards messages as `log` events into a runner's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        Self { tx }
    }
}

impl LogSink for EventSink {
    fn log(&self, level: LogLevel, message: &str) {
        TracingSink.log(level, message);
        // The receiver may be gone when the consumer stopped early.
        let _ = self.tx.send(RunnerEvent::log(level, message));
    }
}

/// Options for [`Workspace::create`].
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    pub base_dir: PathBuf,
    /// Directory name prefix (`<prefix>-<timestamp>-<random>`).
    pub prefix: String,
    pub keep: bool,
    pub limits: ResourceLimits,
    pub sample_interval: Duration,
    /// Report attach/detach activity even without limits.
    pub log_workspace_messages: bool,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("crew-workspaces"),
            prefix: DEFAULT_PREFIX.to_string(),
            keep: false,
            limits: ResourceLimits::default(),
            sample_interval: Duration::from_millis(500),
            log_workspace_messages: false,
        }
    }
}

impl WorkspaceOptions {
    pub fn from_config(cfg: &config::WorkspaceConfig) -> Self {
        let defaults = Self::default();
        Self {
            base_dir: cfg.base_dir.clone().unwrap_or(defaults.base_dir),
            keep: cfg.keep,
            sample_interval: Duration::from_millis(cfg.sample_interval_ms),
            ..defaults
        }
    }
}

/// Files and directories left behind by a retained workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub files: usize,
    pub directories: usize,
    /// Paths relative to the workspace root, sorted.
    pub entries: Vec<PathBuf>,
}

/// Result of [`Workspace::finalize`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub path: PathBuf,
    pub removed: bool,
    pub retained: Option<Inventory>,
    /// Non-fatal cleanup problems.
    pub warnings: Vec<String>,
    pub terminated_reason: Option<String>,
}

/// Masks messages, forwards them to the sink, and appends them to the audit file.
struct AuditLog {
    path: PathBuf,
    sink: Arc<dyn LogSink>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    fn log(&self, level: LogLevel, message: &str) {
        let masked = mask_sensitive(message);
        self.sink.log(level, &masked);
        if let Err(err) = self.append(level, &masked) {
            debug!(err = %err, "audit append failed");
        }
    }

    fn append(&self, level: LogLevel, message: &str) -> std::io::Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        writeln!(
            file,
            "{} {} {}",
            Utc::now().to_rfc3339(),
            level.as_str(),
            message
        )
    }
}

/// Records the first violation and kills the process exactly once.
struct Governor {
    violation: OnceLock<Violation>,
    audit: Arc<AuditLog>,
}

impl Governor {
    /// Returns `true` if this call won the race and killed the process.
    fn terminate(&self, pid: u32, violation: Violation) -> bool {
        let message = format!("terminating process {pid}: {violation}");
        if self.violation.set(violation).is_err() {
            debug!(pid, "ignoring further violation after termination");
            return false;
        }
        self.audit.log(LogLevel::Warn, &message);
        kill_process(pid);
        true
    }

    fn is_terminated(&self) -> bool {
        self.violation.get().is_some()
    }
}

pub struct Workspace {
    path: PathBuf,
    keep: bool,
    limits: ResourceLimits,
    sample_interval: Duration,
    log_workspace_messages: bool,
    audit: Arc<AuditLog>,
    governor: Arc<Governor>,
    monitors: Vec<JoinHandle<()>>,
    attached: Option<u32>,
    report: Option<FinalizeReport>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("path", &self.path)
            .field("keep", &self.keep)
            .field("limits", &self.limits)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Create the base directory (if needed) and a unique child directory.
    pub fn create(options: WorkspaceOptions, sink: Arc<dyn LogSink>) -> Result<Self> {
        fs::create_dir_all(&options.base_dir).with_context(|| {
            format!("create workspace base {}", options.base_dir.display())
        })?;
        let path = create_unique_dir(&options.base_dir, &options.prefix)?;
        let audit = Arc::new(AuditLog {
            path: path.join(AUDIT_FILE),
            sink,
            write_lock: Mutex::new(()),
        });
        let governor = Arc::new(Governor {
            violation: OnceLock::new(),
            audit: Arc::clone(&audit),
        });
        debug!(path = %path.display(), keep = options.keep, "workspace created");
        Ok(Self {
            path,
            keep: options.keep,
            limits: options.limits,
            sample_interval: options.sample_interval,
            log_workspace_messages: options.log_workspace_messages,
            audit,
            governor,
            monitors: Vec::new(),
            attached: None,
            report: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(&self) -> bool {
        self.keep
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The single variable a child needs to find its workspace.
    pub fn environment(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            WORKSPACE_ENV.to_string(),
            self.path.to_string_lossy().into_owned(),
        )])
    }

    /// Log through the masking audit trail.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.audit.log(level, message);
    }

    /// First recorded violation, if the process was terminated.
    pub fn terminated_reason(&self) -> Option<String> {
        self.governor.violation.get().map(ToString::to_string)
    }

    pub fn violation(&self) -> Option<&Violation> {
        self.governor.violation.get()
    }

    /// Attach governance to a spawned process using the platform sampler.
    ///
    /// Must be called from within a tokio runtime when limits are set.
    pub fn attach(&mut self, pid: u32) -> Result<()> {
        self.attach_with_sampler(pid, default_sampler())
    }

    pub fn attach_with_sampler(&mut self, pid: u32, sampler: Box<dyn ProcessSampler>) -> Result<()> {
        if self.limits.is_empty() && !self.log_workspace_messages {
            return Ok(());
        }
        if let Some(existing) = self.attached {
            bail!("workspace already attached to process {existing}");
        }
        if self.report.is_some() {
            bail!("workspace {} already finalized", self.path.display());
        }
        self.attached = Some(pid);
        if self.log_workspace_messages {
            self.audit.log(
                LogLevel::Info,
                &format!("workspace {} attached to process {pid}", self.path.display()),
            );
        }

        if let Some(limit_ms) = self.limits.wall_clock_ms {
            let governor = Arc::clone(&self.governor);
            self.monitors.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(limit_ms)).await;
                governor.terminate(pid, Violation::WallClock { limit_ms });
            }));
        }

        if self.limits.needs_sampler() {
            let governor = Arc::clone(&self.governor);
            let limits = self.limits;
            let interval = self.sample_interval;
            self.monitors.push(tokio::spawn(sample_loop(
                pid, sampler, limits, interval, governor,
            )));
        }
        Ok(())
    }

    /// Record a violation observed outside the monitors (or simulate one).
    pub fn enforce(&self, pid: u32, violation: Violation) -> bool {
        self.governor.terminate(pid, violation)
    }

    /// Stop monitors, then delete or inventory the directory. Idempotent.
    pub fn finalize(&mut self) -> FinalizeReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        for monitor in self.monitors.drain(..) {
            monitor.abort();
        }

        let mut report = FinalizeReport {
            path: self.path.clone(),
            terminated_reason: self.terminated_reason(),
            ..FinalizeReport::default()
        };
        if self.keep {
            let inventory = inventory(&self.path, &mut report.warnings);
            self.audit.log(
                LogLevel::Info,
                &format!(
                    "retaining workspace {} ({} files, {} directories)",
                    self.path.display(),
                    inventory.files,
                    inventory.directories
                ),
            );
            report.retained = Some(inventory);
        } else {
            match fs::remove_dir_all(&self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "workspace removed");
                    report.removed = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    report.removed = true;
                }
                Err(err) => {
                    let message = format!("failed to remove workspace {}: {err}", self.path.display());
                    self.audit.sink.log(LogLevel::Warn, &mask_sensitive(&message));
                    report.warnings.push(message);
                }
            }
        }
        self.report = Some(report.clone());
        report
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.report.is_none() {
            let report = self.finalize();
            if !report.warnings.is_empty() {
                warn!(warnings = ?report.warnings, "workspace finalized on drop with warnings");
            }
        }
    }
}

async fn sample_loop(
    pid: u32,
    mut sampler: Box<dyn ProcessSampler>,
    limits: ResourceLimits,
    interval: Duration,
    governor: Arc<Governor>,
) {
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    let mut cpu = limits.cpu_ms.map(CpuBudget::new);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if governor.is_terminated() {
            break;
        }
        let sample = match sampler.sample(pid) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                debug!(pid, "process gone, sampler stopping");
                break;
            }
            Err(err) => {
                debug!(pid, err = %err, "sampling failed, sampler stopping");
                break;
            }
        };
        if let Some(violation) = limits.check_memory(sample.rss_bytes) {
            governor.terminate(pid, violation);
            break;
        }
        if let Some(violation) = cpu
            .as_mut()
            .and_then(|budget| budget.record(sample.cpu_percent, interval_ms))
        {
            governor.terminate(pid, violation);
            break;
        }
    }
}

/// Force-kill a process (and its group when it leads one).
pub(crate) fn kill_process(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            warn!(pid, "pid out of range, cannot signal");
            return;
        };
        let target = Pid::from_raw(raw);
        if killpg(target, Signal::SIGKILL).is_err()
            && let Err(err) = kill(target, Signal::SIGKILL)
        {
            debug!(pid, err = %err, "kill failed (process likely exited)");
        }
    }
    #[cfg(not(unix))]
    {
        let result = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
        if let Err(err) = result {
            debug!(pid, err = %err, "taskkill failed");
        }
    }
}

fn create_unique_dir(base: &Path, prefix: &str) -> Result<PathBuf> {
    const ATTEMPTS: usize = 8;
    for _ in 0..ATTEMPTS {
        let name = format!(
            "{prefix}-{}-{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            random_suffix()
        );
        let path = base.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create workspace {}", path.display()));
            }
        }
    }
    bail!("could not allocate a unique workspace under {}", base.display())
}

/// Six lowercase alphanumeric characters.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn inventory(root: &Path, warnings: &mut Vec<String>) -> Inventory {
    let mut inv = Inventory::default();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_dir() {
                    inv.directories += 1;
                } else {
                    inv.files += 1;
                }
                if let Ok(rel) = entry.path().strip_prefix(root) {
                    inv.entries.push(rel.to_path_buf());
                }
            }
            Err(err) => warnings.push(format!("inventory: {err}")),
        }
    }
    inv
}
