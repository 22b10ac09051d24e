//! Resource governance on real child processes.

#![cfg(unix)]

use std::process::Stdio;
use std::time::{Duration, Instant};

use crew::core::limits::ResourceLimits;
use crew::io::workspace::{AUDIT_FILE, Workspace, WorkspaceOptions};
use crew::test_support::RecordingSink;
use tokio::process::Command;

fn busy_loop() -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", "while :; do :; done"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .process_group(0);
    cmd
}

#[tokio::test]
async fn wall_clock_limit_kills_busy_process() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sink = RecordingSink::new();
    let mut ws = Workspace::create(
        WorkspaceOptions {
            base_dir: temp.path().to_path_buf(),
            keep: true,
            limits: ResourceLimits {
                wall_clock_ms: Some(100),
                ..ResourceLimits::default()
            },
            ..WorkspaceOptions::default()
        },
        sink.clone(),
    )
    .expect("workspace");

    let mut child = busy_loop().spawn().expect("spawn");
    let started = Instant::now();
    ws.attach(child.id().expect("pid")).expect("attach");

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("child killed in time")
        .expect("wait");
    assert!(!status.success());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(sink.contains("wall clock limit"));
    assert!(
        ws.terminated_reason()
            .expect("reason")
            .contains("wall clock limit")
    );

    let audit = std::fs::read_to_string(ws.path().join(AUDIT_FILE)).expect("audit");
    assert!(audit.contains("wall clock limit"));
    let report = ws.finalize();
    assert!(!report.removed);
    assert!(report.terminated_reason.is_some());
}

#[tokio::test]
async fn finalize_stops_monitors_before_the_limit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sink = RecordingSink::new();
    let mut ws = Workspace::create(
        WorkspaceOptions {
            base_dir: temp.path().to_path_buf(),
            limits: ResourceLimits {
                wall_clock_ms: Some(300),
                ..ResourceLimits::default()
            },
            ..WorkspaceOptions::default()
        },
        sink.clone(),
    )
    .expect("workspace");
    let path = ws.path().to_path_buf();

    let mut child = Command::new("sleep")
        .arg("1")
        .kill_on_drop(true)
        .spawn()
        .expect("spawn");
    ws.attach(child.id().expect("pid")).expect("attach");
    let report = ws.finalize();
    assert!(report.removed);
    assert!(!path.exists());

    let status = child.wait().await.expect("wait");
    assert!(status.success(), "monitor should not have fired");
    assert!(!sink.contains("wall clock limit"));
}

#[tokio::test]
async fn attaching_twice_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut ws = Workspace::create(
        WorkspaceOptions {
            base_dir: temp.path().to_path_buf(),
            log_workspace_messages: true,
            ..WorkspaceOptions::default()
        },
        RecordingSink::new(),
    )
    .expect("workspace");
    ws.attach(std::process::id()).expect("first attach");
    assert!(ws.attach(std::process::id()).is_err());
}
