// crates/server/src/watcher.rs
//! File watcher and change dispatcher.
//!
//! One notify watcher covers the union of all backend roots. Filesystem
//! events are bridged into a tokio channel, debounced into batches, then
//! partitioned: deletions of tracked transcripts, sidecar summary changes,
//! transcript changes for known sessions, and unknown paths (which trigger
//! one discovery pass per batch).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tailboard_core::Backend;

use crate::hub::OutboundEvent;
use crate::state::AppState;
use crate::summarizer;
use crate::supervisor;

/// Aggregate filesystem events at least this long before dispatching.
const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct FileEvent {
    path: PathBuf,
    removed: bool,
}

/// Spawn the watcher task. Cancelling the token stops it cleanly.
pub fn spawn_watcher(state: Arc<AppState>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_watch_loop(state, cancel).await {
            tracing::error!("Watch loop error: {e}");
        }
    })
}

async fn run_watch_loop(state: Arc<AppState>, cancel: CancellationToken) -> notify::Result<()> {
    let (tx, mut rx) = mpsc::channel::<FileEvent>(512);

    // The callback runs on notify's thread: filter early, forward cheaply.
    let multi = state.multi.clone();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let removed = matches!(event.kind, EventKind::Remove(_));
                if !removed && !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                for path in event.paths {
                    if !multi.should_watch_file(&path) {
                        continue;
                    }
                    // Channel full means a catch-up scan would be needed
                    // anyway; the next event re-triggers processing.
                    let _ = tx.try_send(FileEvent { path, removed });
                }
            }
            Err(e) => tracing::error!("File watcher error: {e}"),
        })?;

    let mut watching = 0usize;
    for dir in state.multi.all_project_dirs() {
        if dir.exists() {
            watcher.watch(&dir, RecursiveMode::Recursive)?;
            tracing::info!("Watching {} for session changes", dir.display());
            watching += 1;
        } else {
            tracing::warn!("Project directory does not exist: {}", dir.display());
        }
    }
    if watching == 0 {
        tracing::warn!("No project directories found to watch");
    }

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Watch loop cancelled");
                return Ok(());
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        // Debounce: keep collecting until the window goes quiet.
        let mut batch = vec![first];
        let deadline = Instant::now() + DEBOUNCE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                _ => break,
            }
        }

        process_batch(&state, batch).await;
    }
}

async fn process_batch(state: &Arc<AppState>, batch: Vec<FileEvent>) {
    let mut deleted_paths: BTreeSet<PathBuf> = BTreeSet::new();
    let mut changed_paths: BTreeSet<PathBuf> = BTreeSet::new();
    for event in batch {
        if event.removed {
            deleted_paths.insert(event.path);
        } else {
            changed_paths.insert(event.path);
        }
    }

    // 1. Deletions of tracked transcripts remove the session.
    if !deleted_paths.is_empty() {
        let mut removed_events = Vec::new();
        {
            let mut inner = state.registry.lock().await;
            for path in &deleted_paths {
                let id = inner
                    .ids()
                    .into_iter()
                    .find(|id| inner.get(id).map(|s| &s.path == path).unwrap_or(false));
                if let Some(id) = id {
                    if let Some(session) = inner.remove(&id) {
                        if let Some(handle) = session.process {
                            handle.interrupt();
                        }
                        removed_events.push(OutboundEvent::session_removed(&id));
                    }
                }
            }
        }
        for event in removed_events {
            state.hub.broadcast(event);
        }
    }

    // 2. Partition changes by session.
    let mut sessions_to_process: BTreeSet<String> = BTreeSet::new();
    let mut summary_updates: BTreeSet<String> = BTreeSet::new();
    let mut need_discovery = false;
    {
        let mut inner = state.registry.lock().await;
        for path in &changed_paths {
            let Some(session_id) = state.multi.session_id_from_changed_file(path) else {
                need_discovery = true;
                continue;
            };
            let Some(backend) = state.multi.backend_for_changed_file(path) else {
                continue;
            };
            tracing::debug!(
                "File change: {} -> session {session_id}",
                path.display()
            );

            let Some(session) = inner.get_mut(&session_id) else {
                need_discovery = true;
                continue;
            };

            if backend.is_summary_file(path) {
                summary_updates.insert(session_id);
                continue;
            }

            // Spurious-event filter: an unchanged mtime means the content
            // did not move either.
            let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            if mtime.is_some() && mtime == session.last_seen_mtime {
                continue;
            }
            if let Some(mtime) = mtime {
                session.last_seen_mtime = Some(mtime);
            }
            sessions_to_process.insert(session_id);
        }
    }

    // 3. Unknown paths: one discovery pass per batch.
    if need_discovery {
        check_for_new_sessions(state).await;
    }

    // 4. Tail known sessions and fan out their new messages.
    for session_id in sessions_to_process {
        process_session_messages(state, &session_id).await;
        summarizer::on_session_activity(state, &session_id);
    }

    // 5. Reload sidecars.
    for session_id in summary_updates {
        state.process_session_summary_update(&session_id).await;
    }
}

/// Read a session's new messages and broadcast them, then the updated
/// status and token usage.
pub async fn process_session_messages(state: &Arc<AppState>, session_id: &str) {
    let events = {
        let mut inner = state.registry.lock().await;
        let Some(session) = inner.get_mut(session_id) else {
            return;
        };
        let Some(backend) = state.multi.backend_for_session(&session.path) else {
            return;
        };

        let raw_entries = session.tailer.read_new();
        tracing::debug!(
            session_id = %session_id,
            "read_new returned {} entries",
            raw_entries.len()
        );
        if raw_entries.is_empty() {
            return;
        }

        let mut events: Vec<OutboundEvent> = raw_entries
            .iter()
            .filter_map(|raw| backend.normalize(raw))
            .map(|msg| OutboundEvent::message(session_id, &msg))
            .collect();

        events.push(OutboundEvent::session_status(
            session_id,
            session.process.is_some(),
            session.queue.len(),
            session.tailer.waiting_for_input(),
        ));
        let usage = backend.token_usage(&session.path);
        events.push(OutboundEvent::session_token_usage_updated(session_id, &usage));
        events
    };

    for event in events {
        state.hub.broadcast(event);
    }
}

/// Discovery pass: track any new transcripts, evicting as needed, and
/// attach pending new-session children whose transcript just appeared.
pub async fn check_for_new_sessions(state: &Arc<AppState>) {
    let recent = state
        .multi
        .find_recent(state.config.max_sessions, state.config.include_subagents);

    let mut events: Vec<OutboundEvent> = Vec::new();
    {
        let mut inner = state.registry.lock().await;
        for path in recent {
            if inner.contains_path(&path) {
                continue;
            }
            let (added, evicted) = inner.add(&state.multi, &path, true);

            if let Some(evicted) = evicted {
                if let Some(handle) = &evicted.process {
                    handle.interrupt();
                }
                events.push(OutboundEvent::session_removed(&evicted.id));
            }

            let Some(session_id) = added else { continue };
            let attached = supervisor::attach_pending_process(state, &mut inner, &session_id);

            let Some(backend) = state.multi.backend_for_session(&path) else {
                continue;
            };
            if let Some(session) = inner.get(&session_id) {
                events.push(OutboundEvent::session_added(
                    session.to_wire(backend.as_ref()),
                ));
            }

            // Catchup: connected clients have never seen this session's
            // history, so replay it to them.
            if let Some(session) = inner.get_mut(&session_id) {
                for raw in session.tailer.read_all() {
                    if let Some(msg) = backend.normalize(&raw) {
                        events.push(OutboundEvent::message(&session_id, &msg));
                    }
                }
            }

            if attached {
                if let Some(session) = inner.get(&session_id) {
                    events.push(OutboundEvent::session_status(
                        &session_id,
                        session.process.is_some(),
                        session.queue.len(),
                        session.tailer.waiting_for_input(),
                    ));
                }
            }
        }
    }

    for event in events {
        state.hub.broadcast(event);
    }
}
