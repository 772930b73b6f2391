// crates/server/src/registry.rs
//! In-memory table of tracked sessions.
//!
//! One coarse tokio mutex guards the table. Every structural change and
//! every iteration that must be consistent with changes (client catchup,
//! eviction, discovery adds) runs under it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};

use tailboard_core::{summary_sidecar_path, Backend, MultiBackend, Tailer};

use crate::supervisor::ProcessHandle;

/// A tracked session.
pub struct Session {
    pub id: String,
    pub path: PathBuf,
    pub backend_name: String,
    pub project_name: String,
    pub project_path: String,
    pub first_message: Option<String>,
    pub is_subagent: bool,
    pub parent_session_id: Option<String>,
    pub tailer: Box<dyn Tailer>,
    /// Running CLI child, if any. At most one per session.
    pub process: Option<Arc<ProcessHandle>>,
    /// Messages waiting for the running child to finish.
    pub queue: VecDeque<String>,
    pub summary_title: Option<String>,
    pub summary_short: Option<String>,
    pub summary_executive: Option<String>,
    pub summary_branch: Option<String>,
    /// Last transcript mtime the watcher acted on (spurious-event filter).
    pub last_seen_mtime: Option<SystemTime>,
}

impl Session {
    pub fn summary_path(&self) -> PathBuf {
        summary_sidecar_path(&self.path)
    }

    /// Reload the sidecar summary fields. Returns true when loaded.
    pub fn load_summary(&mut self) -> bool {
        let path = self.summary_path();
        let Ok(text) = std::fs::read_to_string(&path) else {
            return false;
        };
        let Ok(data) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!(session_id = %self.id, "Invalid summary sidecar at {}", path.display());
            return false;
        };
        let get = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        self.summary_title = get("title");
        self.summary_short = get("short_summary");
        self.summary_executive = get("executive_summary");
        self.summary_branch = get("branch");
        true
    }

    /// Sort key: last message timestamp, falling back to file mtime.
    /// Never the raw mtime when messages exist: trailing non-message
    /// appends must not reorder the list.
    pub fn sort_timestamp(&self) -> f64 {
        if let Some(ts) = self.tailer.last_message_timestamp() {
            return ts;
        }
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Wire representation served to clients.
    pub fn to_wire(&self, backend: &dyn Backend) -> Value {
        let started_at = self.tailer.first_timestamp();
        let last_updated = self.tailer.last_message_timestamp().or_else(|| {
            std::fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
        });
        let usage = backend.token_usage(&self.path);

        json!({
            "id": self.id,
            "name": self.project_name,
            "path": self.path.to_string_lossy(),
            "projectName": self.project_name,
            "projectPath": self.project_path,
            "firstMessage": self.first_message,
            "startedAt": started_at,
            "lastUpdatedAt": last_updated,
            "tokenUsage": usage,
            "backend": self.backend_name,
            "isSubagent": self.is_subagent,
            "parentSessionId": self.parent_session_id,
            "summaryTitle": self.summary_title,
            "summaryShort": self.summary_short,
            "summaryExecutive": self.summary_executive,
            "summaryBranch": self.summary_branch,
        })
    }
}

/// A session removed to make room. The caller owns terminating its child
/// and broadcasting the removal.
pub struct Evicted {
    pub id: String,
    pub process: Option<Arc<ProcessHandle>>,
}

/// Table contents; only reachable through the registry lock.
pub struct RegistryInner {
    sessions: HashMap<String, Session>,
    max_sessions: usize,
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
            }),
        }
    }

    /// Acquire the coarse registry lock.
    pub async fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().await
    }
}

impl RegistryInner {
    /// Track a new session file.
    ///
    /// Rejects non-files, empty files, files without messages, and
    /// duplicates, all as `(None, None)`. At the cap, evicts the oldest
    /// session (by last message time, ties by file mtime) when allowed.
    pub fn add(
        &mut self,
        multi: &MultiBackend,
        path: &Path,
        evict_oldest: bool,
    ) -> (Option<String>, Option<Evicted>) {
        if !path.is_file() {
            tracing::debug!("Skipping non-file path: {}", path.display());
            return (None, None);
        }

        let Some(backend) = multi.backend_for_session(path) else {
            tracing::debug!("No backend claims {}", path.display());
            return (None, None);
        };

        let session_id = backend.session_id(path);
        if self.sessions.contains_key(&session_id) {
            return (None, None);
        }

        // Resume creates the file before writing to it.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() == 0 => {
                tracing::debug!("Skipping empty session file: {}", path.display());
                return (None, None);
            }
            Err(_) => return (None, None),
            _ => {}
        }

        if !backend.has_messages(path) {
            tracing::debug!("Skipping session without messages: {}", path.display());
            return (None, None);
        }

        let mut evicted = None;
        if self.sessions.len() >= self.max_sessions {
            if !evict_oldest {
                tracing::debug!("Session limit reached, not adding {}", path.display());
                return (None, None);
            }
            if let Some(oldest_id) = self.oldest_session_id() {
                tracing::info!("Session limit reached, removing oldest: {oldest_id}");
                if let Some(old) = self.sessions.remove(&oldest_id) {
                    evicted = Some(Evicted {
                        id: oldest_id,
                        process: old.process,
                    });
                }
            }
        }

        let metadata = match backend.metadata(path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Failed to read session metadata for {}: {e}", path.display());
                return (None, evicted);
            }
        };

        let mut tailer = backend.create_tailer(path);
        // Live readers never replay history; it is served on demand.
        tailer.seek_to_end();

        let mut session = Session {
            id: session_id.clone(),
            path: path.to_path_buf(),
            backend_name: multi
                .backend_name_for_session(path)
                .unwrap_or_else(|| backend.name().to_string()),
            project_name: metadata.project_name,
            project_path: metadata.project_path.unwrap_or_default(),
            first_message: metadata.first_message,
            is_subagent: metadata.is_subagent,
            parent_session_id: metadata.parent_session_id,
            tailer,
            process: None,
            queue: VecDeque::new(),
            summary_title: None,
            summary_short: None,
            summary_executive: None,
            summary_branch: None,
            last_seen_mtime: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        };
        session.load_summary();

        tracing::info!("Added session: {} ({session_id})", session.project_name);
        self.sessions.insert(session_id.clone(), session);
        (Some(session_id), evicted)
    }

    /// Untrack a session. Does not terminate its child; the caller decides.
    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id);
        if let Some(session) = &removed {
            tracing::info!("Removed session: {} ({session_id})", session.project_name);
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.sessions.values().any(|s| s.path == path)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Most recent session matching a project path (used to route
    /// grant-permission-new back to the session the denial came from).
    pub fn find_by_project_path(&self, project_path: &Path) -> Option<&Session> {
        let canonical = project_path
            .canonicalize()
            .unwrap_or_else(|_| project_path.to_path_buf());
        self.sessions
            .values()
            .filter(|s| {
                !s.project_path.is_empty()
                    && Path::new(&s.project_path)
                        .canonicalize()
                        .map(|p| p == canonical)
                        .unwrap_or(false)
            })
            .max_by(|a, b| {
                a.sort_timestamp()
                    .partial_cmp(&b.sort_timestamp())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    fn oldest_session_id(&self) -> Option<String> {
        self.sessions
            .values()
            .min_by(|a, b| {
                a.sort_timestamp()
                    .partial_cmp(&b.sort_timestamp())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.id.clone())
    }

    /// Wire list for clients, newest first.
    pub fn list_wire(&self, multi: &MultiBackend) -> Vec<Value> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.sort_timestamp()
                .partial_cmp(&a.sort_timestamp())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sessions
            .into_iter()
            .filter_map(|s| {
                let backend = multi.backend_for_session(&s.path)?;
                Some(s.to_wire(backend.as_ref()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tailboard_core::claude_code::ClaudeCodeBackend;

    fn setup() -> (tempfile::TempDir, Arc<MultiBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let projects = dir.path().join("projects");
        fs::create_dir_all(projects.join("-proj")).unwrap();
        let multi = Arc::new(MultiBackend::new(
            vec![Arc::new(ClaudeCodeBackend::new(Some(projects)))],
            None,
        ));
        (dir, multi)
    }

    fn write_session(dir: &tempfile::TempDir, name: &str, ts: &str) -> PathBuf {
        let path = dir.path().join("projects/-proj").join(name);
        fs::write(
            &path,
            format!(
                "{}\n",
                serde_json::json!({
                    "type": "user",
                    "timestamp": ts,
                    "message": {"content": "Help me code"}
                })
            ),
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn add_then_duplicate_is_noop() {
        let (dir, multi) = setup();
        let path = write_session(&dir, "a.jsonl", "2024-12-30T10:00:00Z");

        let registry = SessionRegistry::new(10);
        let mut inner = registry.lock().await;

        let (added, evicted) = inner.add(&multi, &path, true);
        assert_eq!(added.as_deref(), Some("a"));
        assert!(evicted.is_none());

        let (added, evicted) = inner.add(&multi, &path, true);
        assert!(added.is_none());
        assert!(evicted.is_none());
        assert_eq!(inner.count(), 1);
    }

    #[tokio::test]
    async fn empty_and_messageless_files_are_rejected() {
        let (dir, multi) = setup();
        let empty = dir.path().join("projects/-proj/empty.jsonl");
        fs::write(&empty, "").unwrap();
        let no_msgs = dir.path().join("projects/-proj/sys.jsonl");
        fs::write(&no_msgs, "{\"type\":\"system\"}\n").unwrap();

        let registry = SessionRegistry::new(10);
        let mut inner = registry.lock().await;
        assert!(inner.add(&multi, &empty, true).0.is_none());
        assert!(inner.add(&multi, &no_msgs, true).0.is_none());
        assert_eq!(inner.count(), 0);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_by_message_time() {
        let (dir, multi) = setup();
        let t1 = write_session(&dir, "t1.jsonl", "2024-12-30T10:00:00Z");
        let t2 = write_session(&dir, "t2.jsonl", "2024-12-30T10:01:00Z");
        let t3 = write_session(&dir, "t3.jsonl", "2024-12-30T10:02:00Z");

        let registry = SessionRegistry::new(2);
        let mut inner = registry.lock().await;
        inner.add(&multi, &t1, true);
        inner.add(&multi, &t2, true);
        assert_eq!(inner.count(), 2);

        let (added, evicted) = inner.add(&multi, &t3, true);
        assert_eq!(added.as_deref(), Some("t3"));
        assert_eq!(evicted.unwrap().id, "t1");
        assert_eq!(inner.count(), 2);
        assert!(inner.get("t2").is_some());
        assert!(inner.get("t3").is_some());
    }

    #[tokio::test]
    async fn at_cap_without_eviction_rejects() {
        let (dir, multi) = setup();
        let t1 = write_session(&dir, "t1.jsonl", "2024-12-30T10:00:00Z");
        let t2 = write_session(&dir, "t2.jsonl", "2024-12-30T10:01:00Z");

        let registry = SessionRegistry::new(1);
        let mut inner = registry.lock().await;
        inner.add(&multi, &t1, true);
        let (added, evicted) = inner.add(&multi, &t2, false);
        assert!(added.is_none());
        assert!(evicted.is_none());
        assert_eq!(inner.count(), 1);
    }

    #[tokio::test]
    async fn new_tailer_is_sought_to_end() {
        let (dir, multi) = setup();
        let path = write_session(&dir, "a.jsonl", "2024-12-30T10:00:00Z");

        let registry = SessionRegistry::new(10);
        let mut inner = registry.lock().await;
        inner.add(&multi, &path, true);

        let session = inner.get_mut("a").unwrap();
        // History is not replayed live...
        assert_eq!(session.tailer.read_new().len(), 0);
        // ...but explicit replay still sees it.
        assert_eq!(session.tailer.read_all().len(), 1);
    }

    #[tokio::test]
    async fn list_is_sorted_newest_first() {
        let (dir, multi) = setup();
        let t1 = write_session(&dir, "t1.jsonl", "2024-12-30T10:00:00Z");
        let t2 = write_session(&dir, "t2.jsonl", "2024-12-30T11:00:00Z");

        let registry = SessionRegistry::new(10);
        let mut inner = registry.lock().await;
        inner.add(&multi, &t1, true);
        inner.add(&multi, &t2, true);

        let list = inner.list_wire(&multi);
        assert_eq!(list[0]["id"], "t2");
        assert_eq!(list[1]["id"], "t1");
    }

    #[tokio::test]
    async fn wire_shape_has_expected_keys() {
        let (dir, multi) = setup();
        let path = write_session(&dir, "a.jsonl", "2024-12-30T10:00:00Z");

        let registry = SessionRegistry::new(10);
        let mut inner = registry.lock().await;
        inner.add(&multi, &path, true);

        let list = inner.list_wire(&multi);
        let wire = &list[0];
        for key in [
            "id",
            "projectName",
            "projectPath",
            "firstMessage",
            "startedAt",
            "lastUpdatedAt",
            "tokenUsage",
            "backend",
            "summaryTitle",
        ] {
            assert!(wire.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(wire["backend"], "Claude Code");
        assert_eq!(wire["firstMessage"], "Help me code");
    }
}
