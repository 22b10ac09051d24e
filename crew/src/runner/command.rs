//! Generic subprocess runner speaking line-delimited JSON on stdout.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{LogLevel, RunnerEvent};
use crate::core::mask::mask_sensitive;
use crate::core::spec::RunSpec;
use crate::core::translate::StreamTranslator;
use crate::error::RunError;
use crate::io::workspace::{
    EventSink, LogSink, TracingSink, Workspace, WorkspaceOptions, kill_process,
};

use super::{EventStream, Runner};

const DEFAULT_STDERR_LIMIT: usize = 64 * 1024;
/// Stderr bytes quoted in a failure's details.
const STDERR_TAIL: usize = 2048;

/// Runs `program` with templated arguments and translates its output.
///
/// Argument placeholders: `{prompt}`, `{repo_root}`, `{resume}`. Arguments
/// mentioning `{resume}` (and every entry of `resume_args`) are dropped when
/// [`RunSpec::resume_id`] is `None`. [`CommandRunner::with_literal_args`]
/// turns templating off.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    engine: String,
    program: String,
    args: Vec<String>,
    resume_args: Vec<String>,
    templated: bool,
    workspace: WorkspaceOptions,
    stderr_limit: usize,
}

impl CommandRunner {
    pub fn new(engine: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            program: program.into(),
            args: Vec::new(),
            resume_args: Vec::new(),
            templated: true,
            workspace: WorkspaceOptions::default(),
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Pass `args` to the program verbatim, without placeholder expansion.
    pub fn with_literal_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self.resume_args.clear();
        self.templated = false;
        self
    }

    pub fn with_resume_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resume_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Base options for workspaces; limits and keep come from each spec.
    pub fn with_workspace(mut self, options: WorkspaceOptions) -> Self {
        self.workspace = options;
        self
    }

    pub fn with_stderr_limit(mut self, bytes: usize) -> Self {
        self.stderr_limit = bytes;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Expand the argument template for one spec.
pub fn render_args(args: &[String], resume_args: &[String], spec: &RunSpec) -> Vec<String> {
    let repo_root = spec.repo_root().to_string_lossy();
    let expand = |arg: &String, resume: &str| {
        arg.replace("{prompt}", spec.prompt())
            .replace("{repo_root}", &repo_root)
            .replace("{resume}", resume)
    };
    match spec.resume_id() {
        Some(resume) => args
            .iter()
            .chain(resume_args)
            .map(|arg| expand(arg, resume))
            .collect(),
        None => args
            .iter()
            .filter(|arg| !arg.contains("{resume}"))
            .map(|arg| expand(arg, ""))
            .collect(),
    }
}

enum Step {
    Cancelled,
    Workspace(RunnerEvent),
    Read(std::io::Result<usize>),
}

/// Kills the child's process group when the stream is dropped before the
/// child was reaped.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            debug!(pid, "event stream dropped early, killing process group");
            kill_process(pid);
        }
    }
}

/// One stdout line without its terminator; invalid UTF-8 is replaced.
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

impl Runner for CommandRunner {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn run(&self, spec: RunSpec, cancel: CancellationToken) -> EventStream {
        let runner = self.clone();
        Box::pin(async_stream::stream! {
            if cancel.is_cancelled() {
                yield Err(RunError::Cancelled);
                return;
            }
            let started = Instant::now();
            let mut translator = StreamTranslator::new();
            let (log_tx, mut log_rx) = mpsc::unbounded_channel();

            let mut workspace = match runner.open_workspace(&spec, log_tx.clone()) {
                Ok(workspace) => workspace,
                Err(err) => {
                    yield Ok(RunnerEvent::error(
                        format!("failed to create workspace: {err:#}"),
                        Some("workspace_failed"),
                        None,
                    ));
                    yield Ok(translator.done(started.elapsed(), None));
                    return;
                }
            };

            let argv = if runner.templated {
                render_args(&runner.args, &runner.resume_args, &spec)
            } else {
                runner.args.clone()
            };
            let mut cmd = Command::new(&runner.program);
            cmd.args(&argv)
                .current_dir(spec.repo_root())
                .envs(spec.child_env())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(ws) = &workspace {
                cmd.envs(ws.environment());
            }
            #[cfg(unix)]
            cmd.process_group(0);

            info!(engine = %runner.engine, program = %runner.program, "spawning runner process");
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(err) => {
                    warn!(program = %runner.program, err = %err, "spawn failed");
                    for event in finish_workspace(workspace.as_mut()) {
                        yield Ok(event);
                    }
                    yield Ok(RunnerEvent::error(
                        format!("failed to spawn {}: {err}", runner.program),
                        Some("spawn_failed"),
                        Some(json!({ "program": runner.program })),
                    ));
                    yield Ok(translator.done(started.elapsed(), None));
                    return;
                }
            };
            let pid = child.id();
            let mut group = GroupGuard { pid };
            if let (Some(ws), Some(pid)) = (workspace.as_mut(), pid)
                && let Err(err) = ws.attach(pid)
            {
                warn!(pid, err = %err, "could not attach resource governance");
            }

            let stderr_task = child
                .stderr
                .take()
                .map(|stderr| tokio::spawn(read_bounded(stderr, runner.stderr_limit)));
            let Some(stdout) = child.stdout.take() else {
                yield Ok(RunnerEvent::error("child stdout unavailable", Some("spawn_failed"), None));
                yield Ok(translator.done(started.elapsed(), None));
                return;
            };
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            let mut read_failure = None;

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    Some(event) = log_rx.recv() => Step::Workspace(event),
                    read = reader.read_until(b'\n', &mut buf) => Step::Read(read),
                };
                match step {
                    Step::Cancelled => {
                        debug!(pid = ?pid, "run cancelled, killing child");
                        if let Some(pid) = pid {
                            kill_process(pid);
                        }
                        let _ = child.wait().await;
                        group.disarm();
                        finish_workspace(workspace.as_mut());
                        yield Err(RunError::Cancelled);
                        return;
                    }
                    Step::Workspace(event) => yield Ok(event),
                    Step::Read(Ok(0)) => break,
                    Step::Read(Ok(_)) => {
                        let line = decode_line(&buf);
                        buf.clear();
                        if let Some(event) = translator.translate(&line) {
                            yield Ok(event);
                        }
                    }
                    Step::Read(Err(err)) => {
                        warn!(pid = ?pid, err = %err, "stdout read failed, killing child");
                        if let Some(pid) = pid {
                            kill_process(pid);
                        }
                        read_failure = Some(err.to_string());
                        break;
                    }
                }
            }

            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    if let Some(pid) = pid {
                        kill_process(pid);
                    }
                    let _ = child.wait().await;
                    group.disarm();
                    finish_workspace(workspace.as_mut());
                    yield Err(RunError::Cancelled);
                    return;
                }
            };
            group.disarm();
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };

            while let Ok(event) = log_rx.try_recv() {
                yield Ok(event);
            }
            let violation = workspace.as_ref().and_then(|ws| ws.violation().cloned());
            for event in finish_workspace(workspace.as_mut()) {
                yield Ok(event);
            }

            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let failure = if let Some(violation) = violation {
                Some(RunnerEvent::error(
                    violation.to_string(),
                    Some(violation.code()),
                    Some(json!({ "limits": spec.limits() })),
                ))
            } else if let Some(err) = read_failure {
                Some(RunnerEvent::error(
                    format!("failed to read {} output: {err}", runner.program),
                    Some("stdout_read_failed"),
                    None,
                ))
            } else if let Some(upstream) = translator.upstream_error() {
                Some(RunnerEvent::error(
                    upstream.message.clone(),
                    Some(upstream.code.as_deref().unwrap_or("upstream_error")),
                    upstream.details.clone(),
                ))
            } else {
                match &status {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some(RunnerEvent::error(
                        format!("{} exited with {status}", runner.program),
                        Some("exit_status"),
                        Some(json!({
                            "exit_code": exit_code,
                            "stderr": mask_sensitive(tail(&stderr, STDERR_TAIL)),
                        })),
                    )),
                    Err(err) => Some(RunnerEvent::error(
                        format!("failed to wait for {}: {err}", runner.program),
                        Some("wait_failed"),
                        None,
                    )),
                }
            };
            if let Some(failure) = failure {
                yield Ok(failure);
            }
            yield Ok(translator.done(started.elapsed(), exit_code));
        })
    }
}

impl CommandRunner {
    fn open_workspace(
        &self,
        spec: &RunSpec,
        log_tx: mpsc::UnboundedSender<RunnerEvent>,
    ) -> anyhow::Result<Option<Workspace>> {
        let extra = spec.extra();
        if extra.limits.is_empty() && !extra.log_workspace_messages && !extra.keep_workspace {
            return Ok(None);
        }
        let sink: Arc<dyn LogSink> = if extra.log_workspace_messages {
            Arc::new(EventSink::new(log_tx))
        } else {
            Arc::new(TracingSink)
        };
        let options = WorkspaceOptions {
            keep: self.workspace.keep || extra.keep_workspace,
            limits: extra.limits,
            log_workspace_messages: extra.log_workspace_messages,
            ..self.workspace.clone()
        };
        Workspace::create(options, sink).map(Some)
    }
}

/// Finalize the workspace, turning cleanup warnings into log events.
fn finish_workspace(workspace: Option<&mut Workspace>) -> Vec<RunnerEvent> {
    let Some(workspace) = workspace else {
        return Vec::new();
    };
    workspace
        .finalize()
        .warnings
        .into_iter()
        .map(|warning| RunnerEvent::log(LogLevel::Warn, warning))
        .collect()
}

async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the limit so the child never blocks on a full pipe.
                let room = limit.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Environment a run would hand to its child, secrets masked.
pub fn preview_env(spec: &RunSpec) -> BTreeMap<String, String> {
    spec.child_env()
        .into_iter()
        .map(|(key, value)| {
            let masked = mask_sensitive(&format!("{key}={value}"));
            let value = masked
                .split_once('=')
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| masked.clone());
            (key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::stream_violations;
    use crate::core::limits::ResourceLimits;
    use crate::core::spec::RunRequest;
    use crate::runner::collect_events;

    fn spec_in(dir: &std::path::Path, prompt: &str) -> RunRequest {
        RunRequest::new("sh", dir, prompt)
    }

    #[test]
    fn renders_placeholders_and_drops_resume_args() {
        let spec = RunRequest::new("x", "/repo", "fix it").validate().expect("valid");
        let args = vec![
            "run".to_string(),
            "--prompt={prompt}".to_string(),
            "--cwd".to_string(),
            "{repo_root}".to_string(),
            "--resume={resume}".to_string(),
        ];
        let resume = vec!["--session".to_string(), "{resume}".to_string()];
        assert_eq!(
            render_args(&args, &resume, &spec),
            vec!["run", "--prompt=fix it", "--cwd", "/repo"]
        );

        let mut request = RunRequest::new("x", "/repo", "fix it");
        request.resume_id = Some("s-1".to_string());
        let spec = request.validate().expect("valid");
        assert_eq!(
            render_args(&args, &resume, &spec),
            vec![
                "run",
                "--prompt=fix it",
                "--cwd",
                "/repo",
                "--resume=s-1",
                "--session",
                "s-1"
            ]
        );
    }

    #[test]
    fn preview_env_masks_secrets() {
        let mut request = RunRequest::new("x", "/repo", "p");
        request
            .extra
            .env
            .insert("API_TOKEN".to_string(), "hunter2".to_string());
        request
            .extra
            .env
            .insert("MODE".to_string(), "fast".to_string());
        let env = preview_env(&request.validate().expect("valid"));
        assert_eq!(env.get("API_TOKEN").map(String::as_str), Some("***"));
        assert_eq!(env.get("MODE").map(String::as_str), Some("fast"));
    }

    #[test]
    fn decodes_lines_lossily_and_strips_terminators() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 2), "ef");
        assert_eq!(tail("aé", 1), "");
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn sh() -> CommandRunner {
            CommandRunner::new("sh", "sh").with_args(["-c", "{prompt}"])
        }

        #[tokio::test]
        async fn translates_output_and_ends_with_done() {
            let temp = tempfile::tempdir().expect("tempdir");
            let script = r#"echo '{"type":"message","role":"assistant","content":"hi"}'; echo plain text"#;
            let spec = spec_in(temp.path(), script).validate().expect("valid");
            let events = collect_events(sh().run(spec, CancellationToken::new()))
                .await
                .expect("events");

            assert!(stream_violations(&events).is_empty(), "{events:?}");
            assert_eq!(
                events[0],
                RunnerEvent::Message {
                    role: "assistant".to_string(),
                    content: "hi".to_string()
                }
            );
            assert_eq!(events[1], RunnerEvent::log(LogLevel::Info, "plain text"));
            match events.last() {
                Some(RunnerEvent::Done { stats: Some(stats), .. }) => {
                    assert_eq!(stats.exit_code, Some(0));
                }
                other => panic!("expected done, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn nonzero_exit_reports_error_before_done() {
            let temp = tempfile::tempdir().expect("tempdir");
            let spec = spec_in(temp.path(), "echo oops >&2; exit 3")
                .validate()
                .expect("valid");
            let events = collect_events(sh().run(spec, CancellationToken::new()))
                .await
                .expect("events");

            assert!(stream_violations(&events).is_empty(), "{events:?}");
            let n = events.len();
            match &events[n - 2] {
                RunnerEvent::Error { code, details, .. } => {
                    assert_eq!(code.as_deref(), Some("exit_status"));
                    let details = details.as_ref().expect("details");
                    assert_eq!(details["exit_code"], 3);
                    assert!(details["stderr"].as_str().expect("stderr").contains("oops"));
                }
                other => panic!("expected error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn spawn_failure_reports_error_before_done() {
            let temp = tempfile::tempdir().expect("tempdir");
            let runner = CommandRunner::new("missing", "/nonexistent/crew-test-binary");
            let spec = spec_in(temp.path(), "x").validate().expect("valid");
            let events = collect_events(runner.run(spec, CancellationToken::new()))
                .await
                .expect("events");
            assert_eq!(events.len(), 2);
            assert!(matches!(
                &events[0],
                RunnerEvent::Error { code: Some(code), .. } if code == "spawn_failed"
            ));
            assert!(events[1].is_done());
        }

        #[tokio::test]
        async fn passes_explicit_env_to_child() {
            let temp = tempfile::tempdir().expect("tempdir");
            let mut request = spec_in(temp.path(), r#"echo "value=$CREW_TEST_VALUE""#);
            request
                .extra
                .env
                .insert("CREW_TEST_VALUE".to_string(), "42".to_string());
            let events = collect_events(sh().run(request.validate().expect("valid"), CancellationToken::new()))
                .await
                .expect("events");
            assert_eq!(events[0], RunnerEvent::log(LogLevel::Info, "value=42"));
            assert!(std::env::var("CREW_TEST_VALUE").is_err());
        }

        #[tokio::test]
        async fn invalid_utf8_line_does_not_stop_reading() {
            let temp = tempfile::tempdir().expect("tempdir");
            let script = r#"printf 'bad \377 byte\n'; echo '{"type":"message","role":"assistant","content":"after"}'"#;
            let spec = spec_in(temp.path(), script).validate().expect("valid");
            let events = collect_events(sh().run(spec, CancellationToken::new()))
                .await
                .expect("events");

            assert!(stream_violations(&events).is_empty(), "{events:?}");
            assert!(matches!(
                &events[0],
                RunnerEvent::Log { message, .. } if message.starts_with("bad ")
            ));
            assert_eq!(
                events[1],
                RunnerEvent::Message {
                    role: "assistant".to_string(),
                    content: "after".to_string()
                }
            );
            assert!(!events.iter().any(RunnerEvent::is_error), "{events:?}");
        }

        #[tokio::test]
        async fn keeps_draining_output_after_invalid_utf8() {
            let temp = tempfile::tempdir().expect("tempdir");
            let script = r#"printf '\377\n'; head -c 2000000 /dev/zero | tr '\0' a; echo"#;
            let spec = spec_in(temp.path(), script).validate().expect("valid");
            let events = tokio::time::timeout(
                Duration::from_secs(20),
                collect_events(sh().run(spec, CancellationToken::new())),
            )
            .await
            .expect("run finished")
            .expect("events");
            match events.last() {
                Some(RunnerEvent::Done { stats: Some(stats), .. }) => {
                    assert_eq!(stats.exit_code, Some(0));
                }
                other => panic!("expected done, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn literal_args_skip_placeholder_expansion() {
            let temp = tempfile::tempdir().expect("tempdir");
            let runner = CommandRunner::new("exec", "sh")
                .with_literal_args(["-c", "echo '{prompt} {resume} {repo_root}'"]);
            let spec = spec_in(temp.path(), "ignored").validate().expect("valid");
            let events = collect_events(runner.run(spec, CancellationToken::new()))
                .await
                .expect("events");
            assert_eq!(
                events[0],
                RunnerEvent::log(LogLevel::Info, "{prompt} {resume} {repo_root}")
            );
        }

        #[cfg(target_os = "linux")]
        fn process_alive(pid: u32) -> bool {
            // Reparented orphans may linger as zombies until init reaps them.
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => stat
                    .rsplit_once(')')
                    .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
                Err(_) => false,
            }
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn dropping_stream_kills_background_jobs() {
            use futures::StreamExt;

            let temp = tempfile::tempdir().expect("tempdir");
            let pid_file = temp.path().join("bg.pid");
            let script = format!(
                "sleep 30 & echo $! > '{}'; echo started; wait",
                pid_file.display()
            );
            let spec = spec_in(temp.path(), &script).validate().expect("valid");
            let mut stream = sh().run(spec, CancellationToken::new());
            let first = stream.next().await.expect("one event").expect("ok");
            assert_eq!(first, RunnerEvent::log(LogLevel::Info, "started"));

            let bg: u32 = std::fs::read_to_string(&pid_file)
                .expect("pid file")
                .trim()
                .parse()
                .expect("pid");
            assert!(process_alive(bg));
            drop(stream);

            let mut alive = true;
            for _ in 0..100 {
                alive = process_alive(bg);
                if !alive {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(!alive, "background job {bg} survived the dropped stream");
        }

        #[tokio::test]
        async fn cancelled_before_start_yields_only_cancellation() {
            let temp = tempfile::tempdir().expect("tempdir");
            let spec = spec_in(temp.path(), "echo never").validate().expect("valid");
            let cancel = CancellationToken::new();
            cancel.cancel();
            let err = collect_events(sh().run(spec, cancel)).await.unwrap_err();
            assert!(matches!(err, RunError::Cancelled));
        }

        #[tokio::test]
        async fn cancellation_kills_running_child() {
            let temp = tempfile::tempdir().expect("tempdir");
            let spec = spec_in(temp.path(), "sleep 30").validate().expect("valid");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });
            let started = Instant::now();
            let err = collect_events(sh().run(spec, cancel)).await.unwrap_err();
            assert!(matches!(err, RunError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn wall_clock_limit_terminates_busy_child() {
            let temp = tempfile::tempdir().expect("tempdir");
            let runner = sh().with_workspace(WorkspaceOptions {
                base_dir: temp.path().join("ws"),
                ..WorkspaceOptions::default()
            });
            let mut request = spec_in(temp.path(), "while :; do :; done");
            request.extra.limits = ResourceLimits {
                wall_clock_ms: Some(200),
                ..ResourceLimits::default()
            };
            request.extra.log_workspace_messages = true;
            let started = Instant::now();
            let events = collect_events(runner.run(request.validate().expect("valid"), CancellationToken::new()))
                .await
                .expect("events");

            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(stream_violations(&events).is_empty(), "{events:?}");
            assert!(events.iter().any(|e| matches!(
                e,
                RunnerEvent::Log { message, .. } if message.contains("wall clock limit")
            )));
            let n = events.len();
            assert!(matches!(
                &events[n - 2],
                RunnerEvent::Error { code: Some(code), .. } if code == "wall_clock_limit"
            ));
            // Workspace was cleaned up.
            let leftovers = std::fs::read_dir(temp.path().join("ws"))
                .expect("read ws base")
                .count();
            assert_eq!(leftovers, 0);
        }
    }
}
