// crates/core/src/backend.rs
//! The adapter contract every transcript backend implements.
//!
//! A backend knows one on-disk transcript format and one CLI. The server
//! only ever talks to `dyn Backend` / `dyn Tailer`, so the two concrete
//! adapters (and the aggregator on top of them) stay interchangeable.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ParseError;
use crate::message::NormalizedMessage;
use crate::pricing::TokenUsage;

/// Metadata extracted from a session without fully parsing it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub project_name: String,
    pub project_path: Option<String>,
    pub first_message: Option<String>,
    /// ISO-8601 timestamp of the first message.
    pub started_at: Option<String>,
    pub is_subagent: bool,
    pub parent_session_id: Option<String>,
}

/// A CLI invocation produced by a command builder: argv plus an optional
/// stdin payload (messages are passed on stdin, never as shell arguments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// Machine-readable output mode requested from a CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Newline-delimited JSON event stream (permission detection).
    StreamJson,
    /// Single JSON result object (summarization).
    Json,
}

/// Options shared by the three command builders.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub skip_permissions: bool,
    pub output_format: Option<OutputFormat>,
    /// Extra directories the child may access (sandbox allow-list).
    pub add_dirs: Vec<String>,
}

/// Stateful incremental reader for one session.
///
/// A tailer owns a cursor into the transcript. `read_new` advances it;
/// `read_all` replays from the beginning without touching it.
pub trait Tailer: Send {
    /// Read messages appended since the last call, advancing the cursor.
    /// Calling twice with no new content yields an empty second batch.
    fn read_new(&mut self) -> Vec<serde_json::Value>;

    /// Re-read every message from the beginning. Does not move the cursor.
    fn read_all(&mut self) -> Vec<serde_json::Value>;

    /// Advance the cursor past all current content without emitting.
    fn seek_to_end(&mut self);

    /// Whether the transcript's tail indicates the assistant finished its
    /// turn and the session is waiting on the user.
    fn waiting_for_input(&self) -> bool;

    /// ISO-8601 timestamp of the first message, if any.
    fn first_timestamp(&self) -> Option<String>;

    /// Unix timestamp (seconds) of the last message, if any. Derived from
    /// message records, never from file mtime.
    fn last_message_timestamp(&self) -> Option<f64>;
}

/// A transcript backend: format-specific discovery, reading, normalization,
/// accounting, and CLI command construction.
pub trait Backend: Send + Sync {
    /// Human-readable name, e.g. "Claude Code".
    fn name(&self) -> &str;

    /// CLI executable name, if this backend drives one.
    fn cli_command(&self) -> Option<&str>;

    /// Root directory this backend's sessions live under.
    fn projects_dir(&self) -> &Path;

    /// Recently modified sessions with at least one message, newest first.
    /// Warm-up sessions are excluded.
    fn find_recent(&self, limit: usize, include_subagents: bool) -> Vec<PathBuf>;

    /// Stable session id derived from the path. Pure.
    fn session_id(&self, path: &Path) -> String;

    fn metadata(&self, path: &Path) -> Result<SessionMetadata, ParseError>;

    /// False for empty files and files containing only non-message records.
    fn has_messages(&self, path: &Path) -> bool;

    fn create_tailer(&self, path: &Path) -> Box<dyn Tailer>;

    /// Aggregate usage across the whole session.
    fn token_usage(&self, path: &Path) -> TokenUsage;

    /// Model of the first assistant message (keeps summarization on the
    /// warm prompt cache). None when the backend does not record it.
    fn get_model(&self, path: &Path) -> Option<String>;

    /// Convert one raw tailer entry into the unified representation.
    /// None means the entry renders to nothing and must be dropped.
    fn normalize(&self, raw: &serde_json::Value) -> Option<NormalizedMessage>;

    // ----- CLI capabilities -----

    fn supports_fork(&self) -> bool;

    fn supports_permission_detection(&self) -> bool;

    fn is_cli_available(&self) -> bool {
        self.cli_command().map(cli_on_path).unwrap_or(false)
    }

    fn cli_install_instructions(&self) -> &str;

    /// Model identifiers accepted by the new-session builder.
    fn models(&self) -> Vec<String>;

    fn build_send_command(
        &self,
        session_id: &str,
        message: &str,
        opts: &CommandOptions,
    ) -> CommandSpec;

    fn build_fork_command(
        &self,
        session_id: &str,
        message: &str,
        opts: &CommandOptions,
    ) -> CommandSpec;

    fn build_new_session_command(
        &self,
        message: &str,
        model: Option<&str>,
        opts: &CommandOptions,
    ) -> CommandSpec;

    /// Flag that keeps a run out of the session transcript (used by the
    /// summarizer). None when the CLI has no such mode, in which case the
    /// session cannot be summarized without polluting its transcript.
    fn no_persist_flag(&self) -> Option<&str> {
        None
    }

    /// Arguments selecting a model on this CLI.
    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["--model".into(), model.into()]
    }

    // ----- File watching -----

    /// Whether a changed path is a transcript artifact or sidecar this
    /// backend cares about.
    fn should_watch_file(&self, path: &Path) -> bool;

    /// Whether a watched path is a sidecar summary file.
    fn is_summary_file(&self, _path: &Path) -> bool {
        false
    }

    /// Map any watched file back to its owning session id. May read a small
    /// JSON file for formats where the path alone is not enough.
    fn session_id_from_changed_file(&self, path: &Path) -> Option<String>;

    /// Whether a session path (as returned by `find_recent`) belongs to
    /// this backend. Used by the aggregator's owner lookup.
    fn owns_session_path(&self, path: &Path) -> bool;
}

/// Path of the sidecar summary file for a session transcript.
///
/// Pure: `<parent>/<stem>_summary.json`. Exactly one summary file exists
/// per session.
pub fn summary_sidecar_path(session_path: &Path) -> PathBuf {
    let stem = session_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("session");
    session_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}_summary.json"))
}

/// Check whether an executable is reachable through `PATH`.
pub fn cli_on_path(cmd: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(cmd);
        candidate.is_file()
    })
}
