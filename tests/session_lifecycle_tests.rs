//! Session lifecycle: creation validation, auto-continue argument
//! selection, exits, continues and crash recovery.

mod common;

use std::path::PathBuf;

use c3::core::{ExitKind, HubError, SessionStatus};
use c3::sessions::CreateSessionParams;
use common::{TestHub, cleanup_home_subdir, unique_subdir};

#[tokio::test]
async fn create_rejects_relative_paths() {
    let hub = TestHub::new().await;
    let err = hub
        .sessions
        .create(CreateSessionParams {
            working_directory: PathBuf::from("relative/dir"),
            title: String::new(),
            target_worker: None,
            start_fresh: false,
            worktree: false,
        })
        .await
        .expect_err("relative paths must be rejected");
    assert!(matches!(err, HubError::BadInput(_)), "got {err:?}");
}

#[tokio::test]
async fn create_forbids_local_paths_outside_home() {
    let hub = TestHub::new().await;
    let outside = tempfile::TempDir::new().expect("temp dir");
    // /tmp is not under $HOME.
    let err = hub
        .sessions
        .create(CreateSessionParams {
            working_directory: outside.path().to_path_buf(),
            title: String::new(),
            target_worker: None,
            start_fresh: false,
            worktree: false,
        })
        .await
        .expect_err("paths outside $HOME must be rejected on the local worker");
    assert!(matches!(err, HubError::Forbidden(_)), "got {err:?}");
}

#[tokio::test]
async fn create_queues_with_next_position_and_touches_project() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("create");

    let session = hub.create_local_session(&dir).await;
    assert_eq!(session.status, SessionStatus::Queued);
    assert_eq!(session.position, Some(1));
    assert!(session.working_directory.exists(), "directory is created");

    let projects = hub.store.list_projects().await.expect("projects");
    assert!(
        projects
            .iter()
            .any(|p| p.directory_path == session.working_directory),
        "project row is upserted on create"
    );

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn auto_continue_resumes_prior_directory_session() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("auto-continue");

    // Run X to completion with a captured conversation id.
    let x = hub.create_local_session(&dir).await;
    hub.scheduler.run_dispatch_pass().await;
    hub.sessions
        .record_hook_event(x.id, "abc123")
        .await
        .expect("hook event");
    let sender = hub.launcher.event_sender(x.id).expect("mock process");
    sender
        .send(c3::core::ProcessEvent::Exit(ExitKind::Exited(Some(0))))
        .await
        .expect("exit event");
    hub.settle().await;

    let x_row = hub.store.get_session(x.id).await.expect("get").expect("x");
    assert_eq!(x_row.status, SessionStatus::Completed);
    assert_eq!(x_row.claude_session_id.as_deref(), Some("abc123"));

    // A new session in the same directory picks the conversation up.
    let y = hub.create_local_session(&dir).await;
    hub.scheduler.run_dispatch_pass().await;

    let launch = hub
        .launcher
        .launches()
        .into_iter()
        .find(|l| l.session_id == y.id)
        .expect("y launched");
    assert!(
        launch
            .args
            .windows(2)
            .any(|w| w[0] == "--resume" && w[1] == "abc123"),
        "expected --resume abc123, got {:?}",
        launch.args
    );

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn start_fresh_skips_auto_continue() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("start-fresh");

    let x = hub.create_local_session(&dir).await;
    hub.scheduler.run_dispatch_pass().await;
    hub.sessions
        .record_hook_event(x.id, "abc123")
        .await
        .expect("hook event");
    let sender = hub.launcher.event_sender(x.id).expect("mock process");
    sender
        .send(c3::core::ProcessEvent::Exit(ExitKind::Exited(Some(0))))
        .await
        .expect("exit event");
    hub.settle().await;

    let home = dirs::home_dir().expect("home");
    let y = hub
        .sessions
        .create(CreateSessionParams {
            working_directory: home.join(&dir),
            title: String::new(),
            target_worker: None,
            start_fresh: true,
            worktree: false,
        })
        .await
        .expect("create");
    hub.scheduler.run_dispatch_pass().await;

    let launch = hub
        .launcher
        .launches()
        .into_iter()
        .find(|l| l.session_id == y.id)
        .expect("y launched");
    assert!(
        !launch.args.contains(&"--resume".to_owned()),
        "start_fresh must not resume: {:?}",
        launch.args
    );

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn nonzero_exit_marks_failed() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("failed-exit");

    let session = hub.create_local_session(&dir).await;
    hub.scheduler.run_dispatch_pass().await;

    let sender = hub.launcher.event_sender(session.id).expect("mock process");
    sender
        .send(c3::core::ProcessEvent::Exit(ExitKind::Exited(Some(1))))
        .await
        .expect("exit event");
    hub.settle().await;

    let row = hub
        .store
        .get_session(session.id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.status, SessionStatus::Failed);
    assert_eq!(row.pid, None);

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn continue_requeues_at_tail_and_bumps_continuation() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("continue");

    let session = hub.create_local_session(&dir).await;
    hub.scheduler.run_dispatch_pass().await;
    let sender = hub.launcher.event_sender(session.id).expect("mock process");
    sender
        .send(c3::core::ProcessEvent::Exit(ExitKind::Exited(Some(0))))
        .await
        .expect("exit event");
    hub.settle().await;

    hub.sessions
        .continue_session(session.id)
        .await
        .expect("continue");
    let row = hub
        .store
        .get_session(session.id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.status, SessionStatus::Queued);
    assert_eq!(row.continuation_count, 1);

    // Continuing an already queued session is a conflict.
    let err = hub
        .sessions
        .continue_session(session.id)
        .await
        .expect_err("queued sessions cannot be continued");
    assert!(matches!(err, HubError::Conflict(_)), "got {err:?}");

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn crash_recovery_completes_stale_active_rows() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("recovery");

    // Two sessions left active by a "crashed" hub, one with a conversation
    // id captured by the hook before the crash.
    let a = hub.create_local_session(&dir).await;
    let b = hub.create_local_session(&dir).await;
    hub.store
        .mark_session_active(a.id, Some(i32::MAX - 2))
        .await
        .expect("force active");
    hub.store
        .mark_session_active(b.id, Some(i32::MAX - 3))
        .await
        .expect("force active");
    hub.store
        .set_claude_session_id(a.id, "before-crash")
        .await
        .expect("set id");

    hub.sessions.recover_from_crash().await.expect("recover");

    let a_row = hub.store.get_session(a.id).await.expect("get").expect("a");
    let b_row = hub.store.get_session(b.id).await.expect("get").expect("b");
    assert_eq!(a_row.status, SessionStatus::Completed);
    assert_eq!(b_row.status, SessionStatus::Completed);
    assert_eq!(
        a_row.claude_session_id.as_deref(),
        Some("before-crash"),
        "captured conversation ids survive recovery"
    );
    assert_eq!(a_row.pid, None, "no active session references a dead PID");

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn delete_removes_row_and_scrollback() {
    let hub = TestHub::new().await;
    let dir = unique_subdir("delete");

    let session = hub.create_local_session(&dir).await;
    hub.scheduler.run_dispatch_pass().await;

    // Produce some output so scrollback exists on disk after the exit.
    let sender = hub.launcher.event_sender(session.id).expect("mock process");
    sender
        .send(c3::core::ProcessEvent::Data(b"hello from the agent".to_vec()))
        .await
        .expect("data event");
    sender
        .send(c3::core::ProcessEvent::Exit(ExitKind::Exited(Some(0))))
        .await
        .expect("exit event");
    hub.settle().await;

    assert!(
        !hub.mux.load_scrollback(session.id).await.is_empty(),
        "exit flushes scrollback to disk"
    );

    hub.sessions
        .delete_session(session.id)
        .await
        .expect("delete");
    assert!(
        hub.store
            .get_session(session.id)
            .await
            .expect("get")
            .is_none(),
        "row is gone"
    );
    assert!(
        hub.mux.load_scrollback(session.id).await.is_empty(),
        "scrollback is released with the session"
    );

    cleanup_home_subdir(&dir);
}
