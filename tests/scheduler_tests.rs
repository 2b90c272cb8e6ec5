//! Scheduler tests: admission invariants, queue cycling and the
//! auto-suspend guards, all against scripted processes.

mod common;

use c3::core::{SessionPatch, SessionStatus, SettingsPatch};
use common::{TestHub, cleanup_home_subdir, unique_subdir};

async fn set_capacity(hub: &TestHub, local_max: u32, global_max: u32) {
    let local = hub.store.get_local_worker().await.expect("local worker");
    hub.store
        .update_worker(
            local.id,
            &c3::core::WorkerPatch {
                max_sessions: Some(local_max),
                ..Default::default()
            },
        )
        .await
        .expect("worker update");
    hub.store
        .update_settings(&SettingsPatch {
            max_concurrent_sessions: Some(global_max),
            ..Default::default()
        })
        .await
        .expect("settings update");
}

#[tokio::test]
async fn dispatch_respects_worker_capacity() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 2, 10).await;

    let dir = unique_subdir("capacity");
    let a = hub.create_local_session(&dir).await;
    let b = hub.create_local_session(&dir).await;
    let c = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;

    let a = hub.store.get_session(a.id).await.expect("get").expect("a");
    let b = hub.store.get_session(b.id).await.expect("get").expect("b");
    let c = hub.store.get_session(c.id).await.expect("get").expect("c");

    assert_eq!(a.status, SessionStatus::Active);
    assert_eq!(b.status, SessionStatus::Active);
    assert_eq!(c.status, SessionStatus::Queued, "third waits for a slot");
    assert!(c.position.is_some(), "queued implies a position");

    let active = hub.store.count_active_sessions().await.expect("count");
    assert_eq!(active, 2);

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn dispatch_respects_global_ceiling() {
    let hub = TestHub::new().await;
    // Worker would admit 5, the hub ceiling stops at 1.
    set_capacity(&hub, 5, 1).await;

    let dir = unique_subdir("ceiling");
    let a = hub.create_local_session(&dir).await;
    let b = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;

    let a = hub.store.get_session(a.id).await.expect("get").expect("a");
    let b = hub.store.get_session(b.id).await.expect("get").expect("b");
    assert_eq!(a.status, SessionStatus::Active);
    assert_eq!(b.status, SessionStatus::Queued);

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn dispatch_activates_in_position_order() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 1, 1).await;

    let dir = unique_subdir("order");
    let first = hub.create_local_session(&dir).await;
    let second = hub.create_local_session(&dir).await;
    assert!(first.position < second.position, "tail insertion order");

    hub.scheduler.run_dispatch_pass().await;

    let launches = hub.launcher.launches();
    assert_eq!(launches.len(), 1, "only one slot");
    assert_eq!(launches[0].session_id, first.id, "head of queue goes first");

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn queue_cycles_through_suspension() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 2, 2).await;

    let dir = unique_subdir("cycle");
    let a = hub.create_local_session(&dir).await;
    let b = hub.create_local_session(&dir).await;
    let c = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;
    assert_eq!(hub.store.count_active_sessions().await.expect("count"), 2);

    // User interacts with both active sessions (proof-of-work guard).
    hub.mux.write(a.id, b"ok\n".to_vec()).await.expect("write a");
    hub.mux.write(b.id, b"ok\n".to_vec()).await.expect("write b");

    // A goes idle while C starves in the queue.
    hub.inject_idle(a.id).await;
    hub.settle().await;

    let a_row = hub.store.get_session(a.id).await.expect("get").expect("a");
    assert_eq!(
        a_row.status,
        SessionStatus::Queued,
        "suspended session is requeued"
    );
    assert_eq!(a_row.continuation_count, 1);

    // The freed slot admits C on the next pass.
    hub.scheduler.run_dispatch_pass().await;
    let c_row = hub.store.get_session(c.id).await.expect("get").expect("c");
    assert_eq!(c_row.status, SessionStatus::Active, "starved session runs");

    // The suspended session went to the head: it outranks any new entry.
    let queue = hub.store.list_queued_sessions().await.expect("queue");
    assert_eq!(queue.first().map(|s| s.id), Some(a_row.id));

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn idle_without_input_raises_needs_input_instead_of_suspending() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 1, 1).await;

    let dir = unique_subdir("loop-prevention");
    let a = hub.create_local_session(&dir).await;
    let _b = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;

    // A is idle, the queue is non-empty, but nobody ever typed into A.
    hub.inject_idle(a.id).await;
    hub.settle().await;

    let a_row = hub.store.get_session(a.id).await.expect("get").expect("a");
    assert_eq!(
        a_row.status,
        SessionStatus::Active,
        "never-touched sessions are not suspended"
    );
    assert!(a_row.needs_input, "the agent is prompting, flag it");

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn needs_input_blocks_suspension() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 1, 1).await;

    let dir = unique_subdir("needs-input");
    let a = hub.create_local_session(&dir).await;
    let _b = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;
    hub.mux.write(a.id, b"ok\n".to_vec()).await.expect("write");
    hub.store
        .set_session_needs_input(a.id, true)
        .await
        .expect("set flag");

    hub.inject_idle(a.id).await;
    hub.settle().await;

    let a_row = hub.store.get_session(a.id).await.expect("get").expect("a");
    assert_eq!(
        a_row.status,
        SessionStatus::Active,
        "a prompting session keeps its slot"
    );

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn locked_session_is_never_suspended() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 1, 1).await;

    let dir = unique_subdir("locked");
    let a = hub.create_local_session(&dir).await;
    let _b = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;
    hub.mux.write(a.id, b"ok\n".to_vec()).await.expect("write");
    hub.store
        .update_session(
            a.id,
            &SessionPatch {
                locked: Some(true),
                ..Default::default()
            },
        )
        .await
        .expect("lock");

    hub.inject_idle(a.id).await;
    hub.settle().await;

    let a_row = hub.store.get_session(a.id).await.expect("get").expect("a");
    assert_eq!(a_row.status, SessionStatus::Active, "locked sessions stay");

    cleanup_home_subdir(&dir);
}

#[tokio::test]
async fn idle_without_queue_pressure_is_ignored() {
    let hub = TestHub::new().await;
    set_capacity(&hub, 2, 4).await;

    let dir = unique_subdir("no-pressure");
    let a = hub.create_local_session(&dir).await;

    hub.scheduler.run_dispatch_pass().await;
    hub.mux.write(a.id, b"ok\n".to_vec()).await.expect("write");

    hub.inject_idle(a.id).await;
    hub.settle().await;

    let a_row = hub.store.get_session(a.id).await.expect("get").expect("a");
    assert_eq!(
        a_row.status,
        SessionStatus::Active,
        "nobody is starved, no reason to yield"
    );

    cleanup_home_subdir(&dir);
}
