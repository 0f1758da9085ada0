// ABOUTME: Session manager scenarios - buffered sends, history, resume across restarts.
// ABOUTME: Uses scripted subprocesses and an in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use common::{manager_with, MemoryStore};
use elemental_core::{
    AgentRole, ResumeOptions, SessionEventKind, SessionStatus, StartOptions,
};

/// Long-lived echo agent: init after a beat, then reflect stdin records.
/// `$1` carries the resume id when the spawner passes one.
const ECHO_SCRIPT: &str = r#"
SID="${1:-u-fresh}"
sleep 0.3
printf '{"type":"system","subtype":"init","session_id":"%s"}\n' "$SID"
while read line; do printf '%s\n' "$line"; done
"#;

fn start_opts(workdir: &std::path::Path, prompt: &str) -> StartOptions {
    StartOptions {
        initial_prompt: Some(prompt.to_string()),
        working_dir: Some(workdir.to_path_buf()),
        ..Default::default()
    }
}

#[tokio::test]
async fn messages_sent_while_starting_flush_in_order() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_with(ECHO_SCRIPT, store);
    let workdir = tempfile::tempdir().unwrap();

    let starter = {
        let manager = manager.clone();
        let opts = start_opts(workdir.path(), "hello");
        tokio::spawn(async move {
            manager
                .start("agent-1", AgentRole::Worker, opts)
                .await
                .unwrap()
        })
    };

    // The session registers before it is running; catch it mid-start.
    let session_id = loop {
        if let Some(snapshot) = manager.most_recent_for_agent("agent-1") {
            break snapshot.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(
        manager.get(&session_id).unwrap().status,
        SessionStatus::Starting
    );

    let mut stream = manager.stream(&session_id).unwrap();
    manager.send(&session_id, "queued-1").await.unwrap();
    manager.send(&session_id, "queued-2").await.unwrap();

    let started_id = starter.await.unwrap();
    assert_eq!(started_id, session_id);
    assert_eq!(
        manager.get(&session_id).unwrap().status,
        SessionStatus::Running
    );

    // The echo agent reflects every stdin record: the initial prompt first,
    // then the queued messages exactly once, in order.
    let init = stream.next().await.unwrap();
    assert!(init.is_init());
    let mut texts = Vec::new();
    for _ in 0..3 {
        let event = stream.next().await.unwrap();
        match event.kind {
            SessionEventKind::User { text } => texts.push(text),
            other => panic!("expected User echo, got {other:?}"),
        }
    }
    assert_eq!(texts, vec!["hello", "queued-1", "queued-2"]);

    // Later sends take the direct path.
    manager.send(&session_id, "direct").await.unwrap();
    let event = stream.next().await.unwrap();
    match event.kind {
        SessionEventKind::User { text } => assert_eq!(text, "direct"),
        other => panic!("expected User echo, got {other:?}"),
    }

    manager.stop(&session_id, false).await.unwrap();
}

#[tokio::test]
async fn start_then_stop_settles_exactly_one_history_entry() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_with(ECHO_SCRIPT, store.clone());
    let workdir = tempfile::tempdir().unwrap();

    let session_id = manager
        .start("agent-1", AgentRole::Worker, start_opts(workdir.path(), "hi"))
        .await
        .unwrap();
    manager.stop(&session_id, true).await.unwrap();

    let history = manager.history("agent-1", AgentRole::Worker);
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry.session_id, session_id);
    assert_eq!(entry.status, SessionStatus::Terminated);
    assert!(entry.ended_at.is_some());
    assert_eq!(entry.upstream_session_id.as_deref(), Some("u-fresh"));

    // The store saw the terminal status push.
    let updates = store.session_updates.lock().unwrap();
    assert!(updates
        .iter()
        .any(|(agent, update)| agent == "agent-1" && update.status == "terminated"));
}

#[tokio::test]
async fn resume_after_suspend_inherits_the_upstream_id() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_with(ECHO_SCRIPT, store);
    let workdir = tempfile::tempdir().unwrap();

    let first = manager
        .start("agent-1", AgentRole::Worker, start_opts(workdir.path(), "hi"))
        .await
        .unwrap();
    assert_eq!(
        manager.get(&first).unwrap().upstream_session_id.as_deref(),
        Some("u-fresh")
    );
    manager.suspend(&first).await.unwrap();

    let opts = ResumeOptions {
        start: start_opts(workdir.path(), "back again"),
        fall_back_to_start: false,
        require_anchored_work: false,
    };
    let second = manager
        .resume("agent-1", AgentRole::Worker, opts)
        .await
        .unwrap();
    assert_ne!(second, first);

    // The echo script reports `$1` as its session id, so an inherited
    // upstream id proves the resume flag was passed through.
    assert_eq!(
        manager.get(&second).unwrap().upstream_session_id.as_deref(),
        Some("u-fresh")
    );

    manager.stop(&second, false).await.unwrap();
}

#[tokio::test]
async fn resume_across_a_manager_restart_rehydrates_from_the_store() {
    let store = Arc::new(MemoryStore::new());
    store.seed_agent("agent-1", AgentRole::Worker, Some("u-abc"));

    // Fresh manager: no in-memory history at all.
    let manager = manager_with(ECHO_SCRIPT, store);
    let workdir = tempfile::tempdir().unwrap();
    let opts = ResumeOptions {
        start: start_opts(workdir.path(), "resumed"),
        fall_back_to_start: false,
        require_anchored_work: false,
    };
    let session_id = manager
        .resume("agent-1", AgentRole::Worker, opts)
        .await
        .unwrap();

    let snapshot = manager.get(&session_id).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert_eq!(snapshot.upstream_session_id.as_deref(), Some("u-abc"));

    manager.stop(&session_id, false).await.unwrap();
}

#[tokio::test]
async fn failed_startup_drops_queued_sends_with_an_error() {
    // Exits before any init: start must fail and queued messages must not
    // linger for a later session.
    let script = r#"
read line
exit 1
"#;
    let store = Arc::new(MemoryStore::new());
    let manager = manager_with(script, store);
    let workdir = tempfile::tempdir().unwrap();

    let starter = {
        let manager = manager.clone();
        let opts = start_opts(workdir.path(), "hi");
        tokio::spawn(async move {
            manager
                .start("agent-1", AgentRole::Worker, opts)
                .await
        })
    };
    let session_id = loop {
        if let Some(snapshot) = manager.most_recent_for_agent("agent-1") {
            break snapshot.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    // May buffer or fail depending on how far startup got; either way the
    // start itself must error.
    let _ = manager.send(&session_id, "doomed").await;

    let err = starter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "spawn_failure");
    assert_eq!(
        manager.get(&session_id).unwrap().status,
        SessionStatus::Terminated
    );

    // Sending now reports the session state, not a silent buffer.
    let err = manager.send(&session_id, "still there?").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}
