// crates/core/src/multi.rs
//! Aggregation of several backends behind one surface.
//!
//! Discovery unions every backend's sessions; per-session operations are
//! routed to the owning backend through a path→owner map populated on first
//! sight. CLI command construction is deliberately not offered here; the
//! caller must resolve a concrete backend first, because send/fork/new are
//! backend-specific operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::backend::Backend;

/// Wrapper that aggregates sessions from multiple backends.
pub struct MultiBackend {
    backends: Vec<Arc<dyn Backend>>,
    by_name: HashMap<String, usize>,
    /// session path -> index into `backends`.
    owner: RwLock<HashMap<PathBuf, usize>>,
    default_backend: Option<String>,
}

/// Normalized backend name used for lookups ("Claude Code" -> "claude-code").
pub fn normalize_backend_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

impl MultiBackend {
    pub fn new(backends: Vec<Arc<dyn Backend>>, default_backend: Option<String>) -> Self {
        assert!(!backends.is_empty(), "at least one backend is required");
        let by_name = backends
            .iter()
            .enumerate()
            .map(|(i, b)| (normalize_backend_name(b.name()), i))
            .collect();
        Self {
            backends,
            by_name,
            owner: RwLock::new(HashMap::new()),
            default_backend: default_backend.map(|n| normalize_backend_name(&n)),
        }
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn backend_by_name(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.by_name
            .get(&normalize_backend_name(name))
            .map(|&i| self.backends[i].clone())
    }

    /// The backend owning a session path, resolving and caching on first
    /// sight via each backend's path predicate.
    pub fn backend_for_session(&self, path: &Path) -> Option<Arc<dyn Backend>> {
        if let Some(&i) = self.owner.read().unwrap().get(path) {
            return Some(self.backends[i].clone());
        }
        let i = self
            .backends
            .iter()
            .position(|b| b.owns_session_path(path))?;
        self.owner
            .write()
            .unwrap()
            .insert(path.to_path_buf(), i);
        Some(self.backends[i].clone())
    }

    pub fn backend_name_for_session(&self, path: &Path) -> Option<String> {
        self.backend_for_session(path).map(|b| b.name().to_string())
    }

    /// Target backend for a new session with no path yet: caller-supplied
    /// name, then configured default, then first backend with its CLI.
    pub fn backend_for_new_session(&self, requested: Option<&str>) -> Option<Arc<dyn Backend>> {
        if let Some(name) = requested {
            return self.backend_by_name(name);
        }
        if let Some(default) = &self.default_backend {
            if let Some(backend) = self.backend_by_name(default) {
                return Some(backend);
            }
        }
        self.backends
            .iter()
            .find(|b| b.is_cli_available())
            .or_else(|| self.backends.first())
            .cloned()
    }

    /// Recent sessions across every backend, merged and re-sorted by mtime.
    pub fn find_recent(&self, limit: usize, include_subagents: bool) -> Vec<PathBuf> {
        let mut all: Vec<(PathBuf, SystemTime)> = Vec::new();

        for (i, backend) in self.backends.iter().enumerate() {
            for path in backend.find_recent(limit, include_subagents) {
                self.owner.write().unwrap().insert(path.clone(), i);
                let mtime = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                all.push((path, mtime));
            }
        }

        all.sort_by(|a, b| b.1.cmp(&a.1));
        all.truncate(limit);
        all.into_iter().map(|(path, _)| path).collect()
    }

    /// Every distinct root directory to watch.
    pub fn all_project_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for backend in &self.backends {
            let dir = backend.projects_dir().to_path_buf();
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }

    /// True when any backend wants this file.
    pub fn should_watch_file(&self, path: &Path) -> bool {
        self.backends.iter().any(|b| b.should_watch_file(path))
    }

    /// The backend claiming a changed file.
    pub fn backend_for_changed_file(&self, path: &Path) -> Option<Arc<dyn Backend>> {
        self.backends
            .iter()
            .find(|b| b.should_watch_file(path))
            .cloned()
    }

    /// Map a changed file to its session id, first claiming backend wins.
    pub fn session_id_from_changed_file(&self, path: &Path) -> Option<String> {
        for backend in &self.backends {
            if backend.should_watch_file(path) {
                if let Some(id) = backend.session_id_from_changed_file(path) {
                    return Some(id);
                }
            }
        }
        None
    }
}
