// crates/core/src/opencode/mod.rs
//! Backend for OpenCode's directory-of-JSON transcript format.

pub mod cli;
pub mod discovery;
pub mod normalize;
pub mod tailer;

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::backend::{
    Backend, CommandOptions, CommandSpec, SessionMetadata, Tailer,
};
use crate::error::ParseError;
use crate::message::NormalizedMessage;
use crate::pricing::{message_cost, TokenUsage};

use tailer::DirectoryTailer;

/// Backend implementation for OpenCode.
pub struct OpenCodeBackend {
    storage_dir: PathBuf,
}

impl OpenCodeBackend {
    pub fn new(storage_dir: Option<PathBuf>) -> Self {
        let storage_dir = storage_dir
            .or_else(|| discovery::default_storage_dir().ok())
            .unwrap_or_else(|| PathBuf::from(".opencode/storage"));
        Self { storage_dir }
    }
}

impl Backend for OpenCodeBackend {
    fn name(&self) -> &str {
        "OpenCode"
    }

    fn cli_command(&self) -> Option<&str> {
        Some(cli::CLI_COMMAND)
    }

    fn projects_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn find_recent(&self, limit: usize, _include_subagents: bool) -> Vec<PathBuf> {
        // No subagent concept in this format.
        match discovery::find_recent_sessions(&self.storage_dir, limit) {
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

        let session_id = discovery::session_id(path);
        let (project_name, project_path) = discovery::project_info(path);
        let first_message = discovery::first_message_preview(&self.storage_dir, &session_id);
        let started_at = DirectoryTailer::new(&self.storage_dir, &session_id).first_timestamp();

        Ok(SessionMetadata {
            session_id,
            project_name,
            project_path,
            first_message,
            started_at,
            is_subagent: false,
            parent_session_id: None,
        })
    }

    fn has_messages(&self, path: &Path) -> bool {
        discovery::has_messages(path, &self.storage_dir)
    }

    fn create_tailer(&self, path: &Path) -> Box<dyn Tailer> {
        let session_id = discovery::session_id(path);
        Box::new(DirectoryTailer::new(&self.storage_dir, session_id))
    }

    fn token_usage(&self, path: &Path) -> TokenUsage {
        session_token_usage(&self.storage_dir, &discovery::session_id(path))
    }

    fn get_model(&self, _path: &Path) -> Option<String> {
        // Not recorded in a way that helps summarization; the CLI picks.
        None
    }

    fn normalize(&self, raw: &Value) -> Option<NormalizedMessage> {
        normalize::normalize(raw)
    }

    fn supports_fork(&self) -> bool {
        // Forking needs the SDK/server, not the CLI.
        false
    }

    fn supports_permission_detection(&self) -> bool {
        false
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
        // Unsupported; callers gate on supports_fork(). Returning the send
        // shape keeps the trait total without panicking.
        cli::build_send_command(session_id, message, opts)
    }

    fn build_new_session_command(
        &self,
        message: &str,
        model: Option<&str>,
        opts: &CommandOptions,
    ) -> CommandSpec {
        cli::build_new_session_command(message, model, opts)
    }

    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["-m".into(), model.into()]
    }

    fn should_watch_file(&self, path: &Path) -> bool {
        discovery::should_watch_file(&self.storage_dir, path)
    }

    fn session_id_from_changed_file(&self, path: &Path) -> Option<String> {
        discovery::session_id_from_file_path(path, &self.storage_dir)
    }

    fn owns_session_path(&self, path: &Path) -> bool {
        path.starts_with(&self.storage_dir)
            && path.extension().and_then(|e| e.to_str()) == Some("json")
    }
}

/// Aggregate usage: assistant messages carry `tokens`/`cost` directly, or
/// the data lives in their step-finish parts.
fn session_token_usage(storage_dir: &Path, session_id: &str) -> TokenUsage {
    let mut totals = TokenUsage::default();
    let msg_dir = discovery::message_dir(storage_dir, session_id);
    let Ok(entries) = std::fs::read_dir(&msg_dir) else {
        return totals;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        let model = msg.get("modelID").and_then(Value::as_str).map(|m| {
            match msg.get("providerID").and_then(Value::as_str) {
                Some(provider) => format!("{provider}/{m}"),
                None => m.to_string(),
            }
        });
        if let Some(model) = &model {
            totals.add_model(model);
        }

        if msg.get("role").and_then(Value::as_str) == Some("assistant") {
            if let Some(tokens) = msg
                .get("tokens")
                .filter(|t| t.as_object().map(|o| !o.is_empty()).unwrap_or(false))
            {
                accumulate(&mut totals, tokens, msg.get("cost"), model.as_deref());
                continue;
            }
        }

        // No top-level tokens: aggregate from step-finish parts.
        let Some(message_id) = msg.get("id").and_then(Value::as_str) else {
            continue;
        };
        for part in discovery::read_parts(storage_dir, message_id) {
            if part.get("type").and_then(Value::as_str) == Some("step-finish") {
                if let Some(tokens) = part.get("tokens") {
                    accumulate(&mut totals, tokens, part.get("cost"), model.as_deref());
                }
            }
        }
    }

    totals
}

fn accumulate(totals: &mut TokenUsage, tokens: &Value, cost: Option<&Value>, model: Option<&str>) {
    let get = |key: &str| tokens.get(key).and_then(Value::as_u64).unwrap_or(0);
    let cache = tokens.get("cache").cloned().unwrap_or(Value::Null);
    let cache_get = |key: &str| cache.get(key).and_then(Value::as_u64).unwrap_or(0);

    let input = get("input");
    let output = get("output");
    let cache_read = cache_get("read");
    let cache_write = cache_get("write");

    totals.input_tokens += input;
    totals.output_tokens += output;
    totals.cache_read_tokens += cache_read;
    totals.cache_creation_tokens += cache_write;
    totals.message_count += 1;

    let recorded = cost.and_then(Value::as_f64).filter(|c| *c > 0.0);
    totals.cost += recorded
        .unwrap_or_else(|| message_cost(model, input, output, cache_write, cache_read));
}
