// crates/server/tests/supervisor_test.rs
//! Supervisor behavior against a stub `sh`-based CLI: per-session
//! serialization, queue ordering, interrupt, and denial interception.

mod common;

use std::time::Duration;

use common::{stub_state, track, write_transcript, StubCli};
use tailboard_core::Backend;
use tailboard_server::supervisor::{self, NewSessionOutcome, SendOutcome};
use tailboard_server::Config;

/// Two concurrent sends produce one running child and one queued message;
/// the second child runs only after the first exits, and the transcript
/// shows the replies in send order.
#[tokio::test]
async fn concurrent_sends_serialize_per_session() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(
        tmp.path(),
        StubCli::AppendAssistant { delay_ms: 400 },
        false,
        Config::default(),
    );
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    let first = supervisor::send_message(&state, &id, "A").await.unwrap();
    assert_eq!(first, SendOutcome::Sent);

    let second = supervisor::send_message(&state, &id, "B").await.unwrap();
    assert_eq!(second, SendOutcome::Queued { position: 1 });

    // While A runs, exactly one child and one queued message.
    {
        let inner = state.registry.lock().await;
        let session = inner.get(&id).unwrap();
        assert!(session.process.is_some());
        assert_eq!(session.queue.len(), 1);
    }

    // Wait out both runs.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    {
        let inner = state.registry.lock().await;
        let session = inner.get(&id).unwrap();
        assert!(session.process.is_none(), "no child after both runs");
        assert!(session.queue.is_empty());
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let replies: Vec<&str> = content
        .lines()
        .filter(|l| l.contains("\"assistant\""))
        .collect();
    assert_eq!(replies.len(), 2, "exactly two children ran: {content}");
    assert!(replies[0].contains("\"A\""));
    assert!(replies[1].contains("\"B\""));
}

/// Interrupt drains the queue and terminates the running child within the
/// grace window; nothing spawns afterwards.
#[tokio::test]
async fn interrupt_drains_queue_and_terminates() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::SleepForever, false, Config::default());
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    supervisor::send_message(&state, &id, "one").await.unwrap();
    supervisor::send_message(&state, &id, "two").await.unwrap();
    supervisor::send_message(&state, &id, "three").await.unwrap();

    {
        let inner = state.registry.lock().await;
        let session = inner.get(&id).unwrap();
        assert!(session.process.is_some());
        assert_eq!(session.queue.len(), 2);
    }

    let started = std::time::Instant::now();
    supervisor::interrupt_session(&state, &id).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "interrupt returned within the grace window"
    );

    {
        let inner = state.registry.lock().await;
        let session = inner.get(&id).unwrap();
        assert!(session.process.is_none(), "child terminated");
        assert!(session.queue.is_empty(), "queue drained");
    }

    // Nothing respawns after an interrupt.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let inner = state.registry.lock().await;
    assert!(inner.get(&id).unwrap().process.is_none());
}

/// Interrupt with no running child is a 409.
#[tokio::test]
async fn interrupt_idle_session_conflicts() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::SleepForever, false, Config::default());
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    let err = supervisor::interrupt_session(&state, &id).await.unwrap_err();
    assert!(matches!(err, tailboard_server::error::ApiError::Conflict(_)));
}

/// A machine-readable run ending in denials broadcasts `permission_denied`
/// and leaves the queue untouched.
#[tokio::test]
async fn denial_run_broadcasts_and_freezes_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::EmitDenial, true, Config::default());
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    let (_client, mut rx) = state.hub.register();

    supervisor::send_message(&state, &id, "npm please").await.unwrap();
    supervisor::send_message(&state, &id, "queued behind").await.unwrap();

    // Drain events until the denial arrives.
    let denial = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("hub open");
            if event.name == "permission_denied" {
                break event;
            }
        }
    })
    .await
    .expect("denial event");

    assert_eq!(denial.data["session_id"], id.as_str());
    assert_eq!(denial.data["original_message"], "npm please");
    let denials = denial.data["denials"].as_array().unwrap();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0]["tool_name"], "Bash");
    assert_eq!(denials[0]["is_sandbox_denial"], false);
    assert_eq!(denials[0]["error_message"], "Error: tool disabled");

    // The queued message waits for the user's decision.
    let inner = state.registry.lock().await;
    let session = inner.get(&id).unwrap();
    assert!(session.process.is_none());
    assert_eq!(session.queue.len(), 1);
}

/// A new session without permission detection returns `started` after the
/// startup check and leaves its child parked under the working directory.
#[tokio::test]
async fn new_session_parks_child_under_cwd() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, _backend) = stub_state(
        tmp.path(),
        StubCli::AppendAssistant { delay_ms: 900 },
        false,
        Config::default(),
    );
    let project = tmp.path().join("workdir");

    let outcome = supervisor::new_session(
        &state,
        "hello",
        Some(project.to_str().unwrap()),
        None,
        None,
    )
    .await
    .unwrap();

    match outcome {
        NewSessionOutcome::Started { cwd } => {
            assert_eq!(cwd.as_deref(), project.to_str());
        }
        NewSessionOutcome::PermissionDenied { .. } => panic!("no denials expected"),
    }
    assert!(project.is_dir(), "cwd is created when missing");
    assert_eq!(state.pending_new.lock().unwrap().len(), 1);

    // The background monitor clears the pending entry once the child exits.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(state.pending_new.lock().unwrap().is_empty());
}

/// Send to an unknown session is a 404; empty registry stays untouched.
#[tokio::test]
async fn send_to_unknown_session_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, _backend) = stub_state(
        tmp.path(),
        StubCli::AppendAssistant { delay_ms: 10 },
        false,
        Config::default(),
    );

    let err = supervisor::send_message(&state, "ghost", "hello").await.unwrap_err();
    assert!(matches!(
        err,
        tailboard_server::error::ApiError::SessionNotFound(_)
    ));
}
