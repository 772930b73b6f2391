// crates/core/src/claude_code/mod.rs
//! Backend for Claude Code's JSONL transcript format.

pub mod cli;
pub mod discovery;
pub mod normalize;
pub mod tailer;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::backend::{
    Backend, CommandOptions, CommandSpec, SessionMetadata, Tailer,
};
use crate::error::ParseError;
use crate::message::NormalizedMessage;
use crate::pricing::{message_cost, TokenUsage};

use tailer::JsonlTailer;

/// Backend implementation for Claude Code.
pub struct ClaudeCodeBackend {
    projects_dir: PathBuf,
}

impl ClaudeCodeBackend {
    pub fn new(projects_dir: Option<PathBuf>) -> Self {
        let projects_dir = projects_dir
            .or_else(|| discovery::default_projects_dir().ok())
            .unwrap_or_else(|| PathBuf::from(".claude/projects"));
        Self { projects_dir }
    }
}

impl Backend for ClaudeCodeBackend {
    fn name(&self) -> &str {
        "Claude Code"
    }

    fn cli_command(&self) -> Option<&str> {
        Some(cli::CLI_COMMAND)
    }

    fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    fn find_recent(&self, limit: usize, include_subagents: bool) -> Vec<PathBuf> {
        match discovery::find_recent_sessions(&self.projects_dir, limit, include_subagents) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!("Session discovery failed: {e}");
                Vec::new()
            }
        }
    }

    fn session_id(&self, path: &Path) -> String {
        discovery::session_id(path)
    }

    fn metadata(&self, path: &Path) -> Result<SessionMetadata, ParseError> {
        if !path.is_file() {
            return Err(ParseError::not_found(path));
        }

        let (mut project_name, project_path) = discovery::project_info(path);
        let session_id = discovery::session_id(path);
        let first_message = discovery::first_message_preview(path);
        let started_at = JsonlTailer::new(path).first_timestamp();

        let is_subagent = discovery::is_subagent_session(path);
        let parent_session_id = discovery::parent_session_id(path);
        if is_subagent {
            project_name = format!("[subagent] {project_name}");
        }

        Ok(SessionMetadata {
            session_id,
            project_name,
            project_path: Some(project_path),
            first_message,
            started_at,
            is_subagent,
            parent_session_id,
        })
    }

    fn has_messages(&self, path: &Path) -> bool {
        tailer::has_messages(path)
    }

    fn create_tailer(&self, path: &Path) -> Box<dyn Tailer> {
        Box::new(JsonlTailer::new(path))
    }

    fn token_usage(&self, path: &Path) -> TokenUsage {
        session_token_usage(path)
    }

    fn get_model(&self, path: &Path) -> Option<String> {
        first_assistant_model(path)
    }

    fn normalize(&self, raw: &Value) -> Option<NormalizedMessage> {
        normalize::normalize(raw)
    }

    fn supports_fork(&self) -> bool {
        true
    }

    fn supports_permission_detection(&self) -> bool {
        true
    }

    fn cli_install_instructions(&self) -> &str {
        cli::CLI_INSTALL_INSTRUCTIONS
    }

    fn models(&self) -> Vec<String> {
        cli::available_models()
    }

    fn build_send_command(
        &self,
        session_id: &str,
        message: &str,
        opts: &CommandOptions,
    ) -> CommandSpec {
        cli::build_send_command(session_id, message, opts)
    }

    fn build_fork_command(
        &self,
        session_id: &str,
        message: &str,
        opts: &CommandOptions,
    ) -> CommandSpec {
        cli::build_fork_command(session_id, message, opts)
    }

    fn build_new_session_command(
        &self,
        message: &str,
        model: Option<&str>,
        opts: &CommandOptions,
    ) -> CommandSpec {
        cli::build_new_session_command(message, model, opts)
    }

    fn no_persist_flag(&self) -> Option<&str> {
        Some("--no-session-persistence")
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

/// Aggregate usage across all assistant records.
///
/// Streaming writes repeat the usage object under one message id, so totals
/// take the last record seen per id (cumulative counts within a message)
/// and sum across distinct ids.
fn session_token_usage(path: &Path) -> TokenUsage {
    let mut totals = TokenUsage::default();
    let Ok(file) = File::open(path) else {
        return totals;
    };

    // id -> (input, output, cache_creation, cache_read, model)
    let mut per_message: Vec<(Option<String>, [u64; 4], Option<String>)> = Vec::new();

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let Ok(obj) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(usage) = obj.pointer("/message/usage") else {
            continue;
        };
        let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        let counts = [
            get("input_tokens"),
            get("output_tokens"),
            get("cache_creation_input_tokens"),
            get("cache_read_input_tokens"),
        ];
        let id = obj
            .pointer("/message/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let model = obj
            .pointer("/message/model")
            .and_then(Value::as_str)
            .map(str::to_string);

        let existing = id
            .as_deref()
            .and_then(|id| per_message.iter().position(|(i, _, _)| i.as_deref() == Some(id)));
        match existing {
            Some(pos) => per_message[pos].1 = counts,
            None => per_message.push((id, counts, model)),
        }
    }

    for (_, counts, model) in per_message {
        totals.input_tokens += counts[0];
        totals.output_tokens += counts[1];
        totals.cache_creation_tokens += counts[2];
        totals.cache_read_tokens += counts[3];
        totals.message_count += 1;
        totals.cost += message_cost(model.as_deref(), counts[0], counts[1], counts[2], counts[3]);
        if let Some(model) = model {
            totals.add_model(&model);
        }
    }

    totals
}

/// Model of the first assistant record.
fn first_assistant_model(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let Ok(obj) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        if let Some(model) = obj.pointer("/message/model").and_then(Value::as_str) {
            return Some(model.to_string());
        }
    }
    None
}
