//! End-to-end worktree manager scenarios against a real git repository.

use std::fs;
use std::time::Duration;

use crew::error::WorktreeError;
use crew::io::metadata::{load_metadata, sidecar_path, write_metadata};
use crew::io::worktree::{CreateWorktree, WorktreeEvent, WorktreeManager};
use crew::test_support::TestRepo;
use tokio::sync::broadcast;

fn request(run_id: &str, task: &str) -> CreateWorktree {
    CreateWorktree {
        run_id: run_id.to_string(),
        task: Some(task.to_string()),
        base: "base".to_string(),
        ..CreateWorktree::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<WorktreeEvent>) -> Vec<WorktreeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn create_lock_remove_round_trip() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(4).expect("manager");
    let mut rx = manager.subscribe();

    let state = manager
        .create(CreateWorktree {
            lock: true,
            lock_reason: Some("in review".to_string()),
            ..request("run-1", "Demo Task")
        })
        .expect("create");
    assert_eq!(state.id, "wt-run-1-demo-task");
    assert_eq!(state.branch.as_deref(), Some("wt/run-1/demo-task"));
    assert!(state.path.join("README.md").exists());
    assert!(state.locked);
    assert_eq!(state.lock_reason.as_deref(), Some("in review"));
    assert!(!state.prunable);

    let sidecar = sidecar_path(manager.root(), &state.id);
    let meta = load_metadata(&sidecar).expect("load").expect("sidecar");
    assert_eq!(meta.run_id, "run-1");
    assert!(meta.lock.locked);
    assert!(meta.short_sha.is_some());

    let listed = manager.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, state.id);

    let err = manager.remove("run-1", false).unwrap_err();
    assert!(matches!(err, WorktreeError::Locked { .. }), "{err}");
    let err = manager.remove("run-1", true).unwrap_err();
    assert!(matches!(err, WorktreeError::Forbidden(_)), "{err}");

    let unlocked = manager.unlock("run-1").expect("unlock");
    assert!(!unlocked.locked);
    manager.remove(&state.id, false).expect("remove");

    assert!(!state.path.exists());
    assert!(!sidecar.exists());
    assert!(!repo.branch_exists("wt/run-1/demo-task"));
    assert!(manager.list().expect("list").is_empty());

    let names: Vec<String> = drain(&mut rx).into_iter().map(|e| e.name).collect();
    assert_eq!(
        names,
        vec![
            "worktree.create",
            "worktree.lock",
            "worktree.unlock",
            "worktree.remove",
            "worktree.prune"
        ]
    );
}

#[test]
fn prune_event_reports_remaining_count() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(4).expect("manager");
    manager.create(request("run-a", "one")).expect("a");
    manager.create(request("run-b", "two")).expect("b");
    let mut rx = manager.subscribe();

    manager.remove("run-a", false).expect("remove a");
    let events = drain(&mut rx);
    assert_eq!(events[0].payload["force"], false);
    assert_eq!(events[1].payload["after"], 1);

    manager.remove("run-b", false).expect("remove b");
    let events = drain(&mut rx);
    assert_eq!(events[1].payload["after"], 0);
}

#[test]
fn allow_force_removes_locked_worktree() {
    let repo = TestRepo::new().expect("repo");
    let mut settings = repo.settings(2);
    settings.allow_force = true;
    let manager = WorktreeManager::new(repo.path(), settings).expect("manager");

    let state = manager
        .create(CreateWorktree {
            lock: true,
            ..request("run-1", "t")
        })
        .expect("create");
    fs::write(state.path.join("scratch.txt"), "dirty").expect("dirty file");

    manager.remove("run-1", true).expect("forced remove");
    assert!(!state.path.exists());
}

#[test]
fn rejects_conflicts_limits_and_protected_detach() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(2).expect("manager");
    manager.create(request("run-1", "a")).expect("first");

    let err = manager.create(request("run-1", "a")).unwrap_err();
    assert!(matches!(err, WorktreeError::Conflict(_)), "{err}");
    let err = manager.create(request("run-1", "other")).unwrap_err();
    assert!(matches!(err, WorktreeError::Conflict(_)), "{err}");

    repo.git(&["branch", "wt/run-2/b"]).expect("pre-existing branch");
    let err = manager.create(request("run-2", "b")).unwrap_err();
    assert!(matches!(err, WorktreeError::Conflict(_)), "{err}");

    let err = manager
        .create(CreateWorktree {
            detach: true,
            base: "main".to_string(),
            ..request("run-3", "c")
        })
        .unwrap_err();
    assert!(matches!(err, WorktreeError::Forbidden(_)), "{err}");

    let detached = manager
        .create(CreateWorktree {
            detach: true,
            ..request("run-4", "d")
        })
        .expect("detached on unprotected base");
    assert!(detached.detached);
    assert!(detached.branch.is_none());

    let err = manager.create(request("run-5", "e")).unwrap_err();
    assert!(matches!(err, WorktreeError::Limit { max: 2 }), "{err}");

    let err = manager.create(request("../escape", "x")).unwrap_err();
    assert!(matches!(err, WorktreeError::Invalid(_)), "{err}");

    let err = manager
        .create(CreateWorktree {
            base: "--lock".to_string(),
            ..request("run-6", "f")
        })
        .unwrap_err();
    assert!(matches!(err, WorktreeError::Invalid(_)), "{err}");

    let err = manager.remove("nope", false).unwrap_err();
    assert!(matches!(err, WorktreeError::NotFound(_)), "{err}");
}

#[test]
fn creates_detached_worktree_without_checkout() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(2).expect("manager");

    let state = manager
        .create(CreateWorktree {
            detach: true,
            no_checkout: true,
            ..request("run-1", "bare")
        })
        .expect("create");
    assert!(state.path.is_dir());
    assert!(!state.path.join("README.md").exists());
    assert!(state.detached);
    assert!(state.no_checkout);
    assert!(state.branch.is_none());

    let meta = load_metadata(&sidecar_path(manager.root(), &state.id))
        .expect("load")
        .expect("sidecar");
    assert!(meta.no_checkout);
    assert!(meta.detach);
    assert_eq!(meta.base, "base");

    manager.remove(&state.id, true).expect("remove");
    assert!(!state.path.exists());
}

#[test]
fn relock_replaces_reason() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(2).expect("manager");
    manager.create(request("run-1", "a")).expect("create");

    manager
        .lock("run-1", Some("first".to_string()))
        .expect("lock");
    let state = manager
        .lock("run-1", Some("second".to_string()))
        .expect("relock");
    assert!(state.locked);
    assert_eq!(state.lock_reason.as_deref(), Some("second"));
    assert!(state.locked_at.is_some());
}

#[test]
fn gc_removes_expired_unlocked_worktrees_only() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(4).expect("manager");
    let stale = manager.create(request("run-old", "a")).expect("stale");
    manager
        .create(CreateWorktree {
            lock: true,
            ..request("run-held", "b")
        })
        .expect("locked");
    std::thread::sleep(Duration::from_millis(1100));
    let mut rx = manager.subscribe();

    let report = manager.gc(Some("1s")).expect("gc");
    assert_eq!(report.removed, vec![stale.id.clone()]);
    assert_eq!(report.expire, "1s");
    assert!(!stale.path.exists());

    let remaining = manager.list().expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].run_id, "run-held");

    let events = drain(&mut rx);
    let prune = events.last().expect("prune event");
    assert_eq!(prune.name, "worktree.prune");
    assert_eq!(prune.payload["after"], 1);

    let err = manager.gc(Some("soon")).unwrap_err();
    assert!(matches!(err, WorktreeError::Invalid(_)));
}

#[test]
fn repair_restores_missing_and_drops_orphaned_sidecars() {
    let repo = TestRepo::new().expect("repo");
    let manager = repo.manager(4).expect("manager");
    let state = manager.create(request("run-1", "a")).expect("create");

    let sidecar = sidecar_path(manager.root(), &state.id);
    let original = load_metadata(&sidecar).expect("load").expect("sidecar");
    fs::remove_file(&sidecar).expect("delete sidecar");

    let mut ghost = original.clone();
    ghost.id = "wt-ghost-task".to_string();
    ghost.run_id = "ghost".to_string();
    write_metadata(&sidecar_path(manager.root(), &ghost.id), &ghost).expect("ghost");

    let mut rx = manager.subscribe();
    let report = manager.repair().expect("repair");
    assert_eq!(report.restored, vec![state.id.clone()]);
    assert_eq!(report.orphaned, vec!["wt-ghost-task".to_string()]);

    let restored = load_metadata(&sidecar).expect("load").expect("restored");
    assert_eq!(restored.run_id, "run-1");
    assert_eq!(restored.branch.as_deref(), Some("wt/run-1/a"));

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "worktree.repair");
    assert_eq!(events[0].payload["status"], "ok");
}

#[test]
fn fresh_manager_sees_existing_worktrees() {
    let repo = TestRepo::new().expect("repo");
    let first = repo.manager(4).expect("manager");
    first
        .create(CreateWorktree {
            lock: true,
            lock_reason: Some("keep".to_string()),
            ..request("run-1", "a")
        })
        .expect("create");
    drop(first);

    let second = repo.manager(4).expect("manager");
    let state = second.get("run-1").expect("found by run id");
    assert!(state.locked);
    assert_eq!(state.lock_reason.as_deref(), Some("keep"));
    assert!(second.reconcile().expect("reconcile").restored.is_empty());
}
