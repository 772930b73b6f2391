// crates/server/tests/watcher_test.rs
//! Change-dispatch scenarios: live append fan-out, eviction broadcast on
//! discovery, and new-session attach-on-appear.

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{stub_state, track, write_transcript, StubCli};
use tailboard_core::Backend;
use tailboard_server::supervisor::{canonical_key, ProcessHandle};
use tailboard_server::{watcher, Config};

fn set_mtime(path: &Path, to: std::time::SystemTime) {
    let f = OpenOptions::new().append(true).open(path).unwrap();
    f.set_modified(to).unwrap();
}

fn append_assistant(path: &Path, text: &str, ts: &str) {
    let line = serde_json::json!({
        "type": "assistant",
        "timestamp": ts,
        "message": {"content": [{"type": "text", "text": text}]}
    });
    let mut f = OpenOptions::new().append(true).open(path).unwrap();
    writeln!(f, "{line}").unwrap();
}

/// Live append: a connected client receives the new message, then the
/// waiting status, then updated token usage, in that order.
#[tokio::test]
async fn live_append_fans_out_message_status_usage() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(
        tmp.path(),
        StubCli::SleepForever,
        false,
        Config::default(),
    );
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    let (_client, mut rx) = state.hub.register();

    append_assistant(&path, "Hello", "2024-12-30T10:00:01Z");
    watcher::process_session_messages(&state, &id).await;

    let message = rx.recv().await.unwrap();
    assert_eq!(message.name, "message");
    assert_eq!(message.data["session_id"], id.as_str());
    assert_eq!(message.data["message"]["role"], "assistant");
    assert_eq!(message.data["message"]["blocks"][0]["text"], "Hello");

    let status = rx.recv().await.unwrap();
    assert_eq!(status.name, "session_status");
    assert_eq!(status.data["waiting_for_input"], true);
    assert_eq!(status.data["running"], false);

    let usage = rx.recv().await.unwrap();
    assert_eq!(usage.name, "session_token_usage_updated");
    assert_eq!(usage.data["session_id"], id.as_str());
}

/// A second read with no new content emits nothing.
#[tokio::test]
async fn no_new_content_is_silent() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::SleepForever, false, Config::default());
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    let (_client, mut rx) = state.hub.register();
    watcher::process_session_messages(&state, &id).await;

    let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "no events for an unchanged transcript");
}

/// Discovery over a capped registry evicts the oldest session and tells
/// clients about both the eviction and the addition.
#[tokio::test]
async fn discovery_evicts_oldest_and_broadcasts() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(
        tmp.path(),
        StubCli::SleepForever,
        false,
        Config {
            max_sessions: 2,
            ..Config::default()
        },
    );

    // Space the mtimes out explicitly; the discovery scan is mtime-sorted
    // and capped, so ties would make the scan order arbitrary.
    let now = std::time::SystemTime::now();
    let t1 = write_transcript(backend.projects_dir(), "t1", "2024-12-30T10:00:00Z");
    set_mtime(&t1, now - Duration::from_secs(60));
    watcher::check_for_new_sessions(&state).await;
    let t2 = write_transcript(backend.projects_dir(), "t2", "2024-12-30T10:01:00Z");
    set_mtime(&t2, now - Duration::from_secs(30));
    watcher::check_for_new_sessions(&state).await;

    let (_client, mut rx) = state.hub.register();

    let t3 = write_transcript(backend.projects_dir(), "t3", "2024-12-30T10:02:00Z");
    set_mtime(&t3, now);
    watcher::check_for_new_sessions(&state).await;

    let removed = rx.recv().await.unwrap();
    assert_eq!(removed.name, "session_removed");
    assert_eq!(removed.data["id"], "t1");

    let added = rx.recv().await.unwrap();
    assert_eq!(added.name, "session_added");
    assert_eq!(added.data["id"], "t3");

    let inner = state.registry.lock().await;
    assert_eq!(inner.count(), 2);
    assert!(inner.get("t1").is_none());
    assert!(inner.get("t2").is_some());
    assert!(inner.get("t3").is_some());
}

/// Discovery replays a new session's history to already-connected clients.
#[tokio::test]
async fn discovery_broadcasts_catchup_messages() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::SleepForever, false, Config::default());

    let (_client, mut rx) = state.hub.register();

    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    append_assistant(&path, "Hi back", "2024-12-30T10:00:01Z");
    watcher::check_for_new_sessions(&state).await;

    let added = rx.recv().await.unwrap();
    assert_eq!(added.name, "session_added");

    let first = rx.recv().await.unwrap();
    assert_eq!(first.name, "message");
    assert_eq!(first.data["message"]["role"], "user");

    let second = rx.recv().await.unwrap();
    assert_eq!(second.name, "message");
    assert_eq!(second.data["message"]["blocks"][0]["text"], "Hi back");
}

/// Encode a filesystem path the way the JSONL layout names project dirs.
fn encode_project_dir(path: &Path) -> String {
    format!(
        "-{}",
        path.to_str()
            .unwrap()
            .trim_start_matches('/')
            .replace(['/', '.', '_'], "-")
    )
}

/// A pending new-session child is attached when its transcript appears
/// under the same working directory, so interrupt can reach it.
#[tokio::test]
async fn pending_child_attaches_on_discovery() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::SleepForever, false, Config::default());

    // The real project directory the child was started in.
    let project = tmp.path().join("proj");
    std::fs::create_dir_all(&project).unwrap();

    let handle = ProcessHandle::new();
    state
        .pending_new
        .lock()
        .unwrap()
        .insert(canonical_key(&project), handle.clone());

    // Its transcript appears under the encoded project folder.
    let encoded = encode_project_dir(&project);
    let session_dir = backend.projects_dir().join(&encoded);
    std::fs::create_dir_all(&session_dir).unwrap();
    let transcript = session_dir.join("fresh.jsonl");
    std::fs::write(
        &transcript,
        format!(
            "{}\n",
            serde_json::json!({
                "type": "user",
                "timestamp": "2024-12-30T10:00:00Z",
                "message": {"content": "hello"}
            })
        ),
    )
    .unwrap();

    watcher::check_for_new_sessions(&state).await;

    let inner = state.registry.lock().await;
    let session = inner.get("fresh").expect("session tracked");
    let attached = session.process.as_ref().expect("child attached");
    assert!(Arc::ptr_eq(attached, &handle));
    assert!(state.pending_new.lock().unwrap().is_empty());
}

/// Sidecar changes reload the summary fields and notify clients.
#[tokio::test]
async fn summary_sidecar_reload_broadcasts() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, backend) = stub_state(tmp.path(), StubCli::SleepForever, false, Config::default());
    let path = write_transcript(backend.projects_dir(), "s1", "2024-12-30T10:00:00Z");
    let id = track(&state, &path).await;

    let sidecar = path.with_file_name("s1_summary.json");
    std::fs::write(
        &sidecar,
        serde_json::json!({
            "title": "Build fix",
            "short_summary": "Fixed the build",
            "executive_summary": "The build broke; it is fixed now.",
            "branch": "main"
        })
        .to_string(),
    )
    .unwrap();

    let (_client, mut rx) = state.hub.register();
    state.process_session_summary_update(&id).await;

    let event = rx.recv().await.unwrap();
    assert_eq!(event.name, "session_summary_updated");
    assert_eq!(event.data["summaryTitle"], "Build fix");
    assert_eq!(event.data["summaryShort"], "Fixed the build");

    let inner = state.registry.lock().await;
    let session = inner.get(&id).unwrap();
    assert_eq!(session.summary_branch.as_deref(), Some("main"));
}
