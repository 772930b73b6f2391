// crates/server/src/state.rs
//! Application state threaded through every component.
//!
//! No process-wide mutables: everything lives in one context value created
//! at startup and shared via `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tailboard_core::{Backend, MultiBackend};

use crate::config::Config;
use crate::hub::{EventHub, OutboundEvent};
use crate::permissions::AllowedDirectories;
use crate::registry::SessionRegistry;
use crate::supervisor::ProcessHandle;

pub struct AppState {
    pub config: Config,
    pub multi: Arc<MultiBackend>,
    pub registry: SessionRegistry,
    pub hub: EventHub,
    /// Children of new sessions whose transcript has not appeared yet,
    /// keyed by canonicalized working directory.
    pub pending_new: Mutex<HashMap<String, Arc<ProcessHandle>>>,
    /// Sandbox allow-list threaded into CLI invocations.
    pub allowed_dirs: AllowedDirectories,
    /// Models fetched per backend; indexes are the model_index namespace.
    pub cached_models: Mutex<HashMap<String, Vec<String>>>,
    /// Scheduled idle-summary jobs, keyed by session id.
    pub idle_jobs: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config, multi: Arc<MultiBackend>, allowed_dirs_path: PathBuf) -> Arc<Self> {
        let registry = SessionRegistry::new(config.max_sessions);
        Arc::new(Self {
            config,
            multi,
            registry,
            hub: EventHub::new(),
            pending_new: Mutex::new(HashMap::new()),
            allowed_dirs: AllowedDirectories::load(allowed_dirs_path),
            cached_models: Mutex::new(HashMap::new()),
            idle_jobs: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        })
    }

    /// Broadcast a session's running/queued/waiting flags.
    pub async fn broadcast_session_status(&self, session_id: &str) {
        let event = {
            let inner = self.registry.lock().await;
            let Some(session) = inner.get(session_id) else {
                return;
            };
            OutboundEvent::session_status(
                session_id,
                session.process.is_some(),
                session.queue.len(),
                session.tailer.waiting_for_input(),
            )
        };
        self.hub.broadcast(event);
    }

    /// Broadcast a session's recomputed token usage.
    pub async fn broadcast_token_usage(&self, session_id: &str) {
        let event = {
            let inner = self.registry.lock().await;
            let Some(session) = inner.get(session_id) else {
                return;
            };
            let Some(backend) = self.multi.backend_for_session(&session.path) else {
                return;
            };
            let usage = backend.token_usage(&session.path);
            OutboundEvent::session_token_usage_updated(session_id, &usage)
        };
        self.hub.broadcast(event);
    }

    /// Reload a session's sidecar summary and broadcast the new fields.
    pub async fn process_session_summary_update(&self, session_id: &str) {
        let event = {
            let mut inner = self.registry.lock().await;
            let Some(session) = inner.get_mut(session_id) else {
                tracing::debug!("Summary update for unknown session {session_id}");
                return;
            };
            if !session.load_summary() {
                tracing::debug!("No loadable summary for session {session_id}");
                return;
            }
            tracing::info!(
                session_id = %session_id,
                title = ?session.summary_title,
                "Summary updated"
            );
            OutboundEvent::session_summary_updated(
                session_id,
                session.summary_title.as_deref(),
                session.summary_short.as_deref(),
                session.summary_executive.as_deref(),
            )
        };
        self.hub.broadcast(event);
    }
}
