// crates/server/tests/common/mod.rs
//! Shared fixtures: a stub backend whose CLI is a small `sh` script, so
//! supervisor behavior can be exercised without any real assistant CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use tailboard_core::claude_code::{discovery, normalize, tailer};
use tailboard_core::{
    Backend, CommandOptions, CommandSpec, MultiBackend, NormalizedMessage, ParseError,
    SessionMetadata, Tailer, TokenUsage,
};
use tailboard_server::{AppState, Config};

/// What the stub CLI does when spawned.
#[derive(Debug, Clone)]
pub enum StubCli {
    /// Sleep, then append one assistant text line (the message itself) to
    /// the session transcript.
    AppendAssistant { delay_ms: u64 },
    /// Sleep far longer than any test runs (interrupt fodder).
    SleepForever,
    /// Emit a stream-json run ending in a result record with one denial.
    EmitDenial,
}

/// JSONL-reading backend whose CLI is `sh`.
pub struct StubBackend {
    projects_dir: PathBuf,
    pub cli: StubCli,
    pub permission_detection: bool,
}

impl StubBackend {
    pub fn new(projects_dir: PathBuf, cli: StubCli) -> Self {
        Self {
            projects_dir,
            cli,
            permission_detection: false,
        }
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.projects_dir.join("-proj").join(format!("{session_id}.jsonl"))
    }

    fn script_for(&self, session_id: &str, message: &str) -> String {
        let path = self.session_path(session_id);
        match &self.cli {
            StubCli::AppendAssistant { delay_ms } => {
                let line = serde_json::json!({
                    "type": "assistant",
                    "timestamp": "2024-12-30T10:00:05Z",
                    "message": {"content": [{"type": "text", "text": message}]}
                });
                format!(
                    "sleep {}; printf '%s\\n' '{}' >> '{}'",
                    *delay_ms as f64 / 1000.0,
                    line,
                    path.display()
                )
            }
            StubCli::SleepForever => "sleep 600".to_string(),
            StubCli::EmitDenial => {
                let error = serde_json::json!({
                    "type": "user",
                    "message": {"content": [{
                        "type": "tool_result",
                        "tool_use_id": "t1",
                        "is_error": true,
                        "content": "Error: tool disabled"
                    }]}
                });
                let result = serde_json::json!({
                    "type": "result",
                    "result": "done",
                    "permission_denials": [{
                        "tool_name": "Bash",
                        "tool_use_id": "t1",
                        "tool_input": {"command": "npm test"}
                    }]
                });
                // The short sleep keeps a follow-up send queued behind
                // this run instead of racing its exit.
                format!("sleep 0.3; printf '%s\\n' '{error}'; printf '%s\\n' '{result}'")
            }
        }
    }

    fn sh_spec(&self, script: String) -> CommandSpec {
        CommandSpec {
            args: vec!["sh".into(), "-c".into(), script],
            stdin: None,
        }
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &str {
        "Stub"
    }

    fn cli_command(&self) -> Option<&str> {
        Some("sh")
    }

    fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    fn find_recent(&self, limit: usize, include_subagents: bool) -> Vec<PathBuf> {
        discovery::find_recent_sessions(&self.projects_dir, limit, include_subagents)
            .unwrap_or_default()
    }

    fn session_id(&self, path: &Path) -> String {
        discovery::session_id(path)
    }

    fn metadata(&self, path: &Path) -> Result<SessionMetadata, ParseError> {
        if !path.is_file() {
            return Err(ParseError::not_found(path));
        }
        let (project_name, project_path) = discovery::project_info(path);
        Ok(SessionMetadata {
            session_id: discovery::session_id(path),
            project_name,
            project_path: Some(project_path),
            first_message: discovery::first_message_preview(path),
            started_at: tailer::JsonlTailer::new(path).first_timestamp(),
            is_subagent: false,
            parent_session_id: None,
        })
    }

    fn has_messages(&self, path: &Path) -> bool {
        tailer::has_messages(path)
    }

    fn create_tailer(&self, path: &Path) -> Box<dyn Tailer> {
        Box::new(tailer::JsonlTailer::new(path))
    }

    fn token_usage(&self, _path: &Path) -> TokenUsage {
        TokenUsage::default()
    }

    fn get_model(&self, _path: &Path) -> Option<String> {
        None
    }

    fn normalize(&self, raw: &Value) -> Option<NormalizedMessage> {
        normalize::normalize(raw)
    }

    fn supports_fork(&self) -> bool {
        true
    }

    fn supports_permission_detection(&self) -> bool {
        self.permission_detection
    }

    fn cli_install_instructions(&self) -> &str {
        "Install a POSIX shell."
    }

    fn models(&self) -> Vec<String> {
        vec!["stub-model".into()]
    }

    fn build_send_command(
        &self,
        session_id: &str,
        message: &str,
        _opts: &CommandOptions,
    ) -> CommandSpec {
        self.sh_spec(self.script_for(session_id, message))
    }

    fn build_fork_command(
        &self,
        session_id: &str,
        message: &str,
        opts: &CommandOptions,
    ) -> CommandSpec {
        self.build_send_command(session_id, message, opts)
    }

    fn build_new_session_command(
        &self,
        message: &str,
        _model: Option<&str>,
        _opts: &CommandOptions,
    ) -> CommandSpec {
        self.sh_spec(self.script_for("new", message))
    }

    fn should_watch_file(&self, path: &Path) -> bool {
        discovery::should_watch_file(path, true)
    }

    fn is_summary_file(&self, path: &Path) -> bool {
        discovery::is_summary_file(path)
    }

    fn session_id_from_changed_file(&self, path: &Path) -> Option<String> {
        if discovery::is_summary_file(path) {
            return discovery::session_id_from_summary_file(path);
        }
        Some(discovery::session_id(path))
    }

    fn owns_session_path(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("jsonl")
    }
}

/// A transcript with one user message; returns its path.
pub fn write_transcript(projects_dir: &Path, session_id: &str, ts: &str) -> PathBuf {
    let dir = projects_dir.join("-proj");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{session_id}.jsonl"));
    std::fs::write(
        &path,
        format!(
            "{}\n",
            serde_json::json!({
                "type": "user",
                "timestamp": ts,
                "message": {"content": "Hi"}
            })
        ),
    )
    .unwrap();
    path
}

/// State wired to a stub backend over a temp projects dir.
pub fn stub_state(
    tmp: &Path,
    cli: StubCli,
    permission_detection: bool,
    config: Config,
) -> (Arc<AppState>, Arc<StubBackend>) {
    let projects_dir = tmp.join("projects");
    std::fs::create_dir_all(projects_dir.join("-proj")).unwrap();

    let mut backend = StubBackend::new(projects_dir, cli);
    backend.permission_detection = permission_detection;
    let backend = Arc::new(backend);

    let multi = Arc::new(MultiBackend::new(
        vec![backend.clone() as Arc<dyn Backend>],
        None,
    ));
    let state = AppState::new(config, multi, tmp.join("allowed-dirs.json"));
    (state, backend)
}

/// Track an existing transcript in the registry.
pub async fn track(state: &Arc<AppState>, path: &Path) -> String {
    let mut inner = state.registry.lock().await;
    let (added, _) = inner.add(&state.multi, path, true);
    added.expect("session should be tracked")
}
