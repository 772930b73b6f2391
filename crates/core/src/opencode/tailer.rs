// crates/core/src/opencode/tailer.rs
//! Incremental reader for directory-based sessions.
//!
//! The cursor is the set of message ids already emitted. A message is
//! emitted once, when it becomes ready; later part updates never re-emit
//! it, so clients observe an append-only stream.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::{json, Value};

use super::discovery::{message_dir, read_parts};
use crate::backend::Tailer;

/// Tailer over `message/<sid>/` and `part/<mid>/` JSON trees.
pub struct DirectoryTailer {
    storage_dir: PathBuf,
    session_id: String,
    seen_messages: HashSet<String>,
    waiting_for_input: bool,
}

impl DirectoryTailer {
    pub fn new(storage_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            session_id: session_id.into(),
            seen_messages: HashSet::new(),
            waiting_for_input: false,
        }
    }

    fn message_files(&self) -> Vec<PathBuf> {
        let dir = message_dir(&self.storage_dir, &self.session_id);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    }

    fn read_entry(&self, path: &PathBuf) -> Option<Value> {
        let text = std::fs::read_to_string(path).ok()?;
        let info: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to read message file {}: {e}", path.display());
                return None;
            }
        };
        let message_id = info.get("id").and_then(Value::as_str)?.to_string();
        let parts = read_parts(&self.storage_dir, &message_id);
        Some(json!({ "info": info, "parts": parts }))
    }

    fn update_waiting_state(&mut self, entries: &[Value]) {
        let Some(last) = entries.last() else { return };
        let info = &last["info"];
        let parts = last["parts"].as_array().cloned().unwrap_or_default();

        match info.get("role").and_then(Value::as_str) {
            Some("assistant") => {
                let Some(last_part) = parts.last() else {
                    self.waiting_for_input = false;
                    return;
                };
                match last_part.get("type").and_then(Value::as_str) {
                    // A trailing text or step-finish part means the turn is done.
                    Some("text") | Some("step-finish") => self.waiting_for_input = true,
                    Some("tool") | Some("step-start") => self.waiting_for_input = false,
                    _ => {}
                }
            }
            Some("user") => self.waiting_for_input = false,
            _ => {}
        }
    }
}

/// A message may exist on disk before its content does. User messages are
/// ready once any part has non-empty text; assistant messages once a
/// step-finish part marks the turn complete.
fn is_ready(info: &Value, parts: &[Value]) -> bool {
    match info.get("role").and_then(Value::as_str) {
        Some("user") => parts.iter().any(|p| {
            p.get("type").and_then(Value::as_str) == Some("text")
                && p.get("text")
                    .and_then(Value::as_str)
                    .map(|t| !t.is_empty())
                    .unwrap_or(false)
        }),
        _ => parts
            .iter()
            .any(|p| p.get("type").and_then(Value::as_str) == Some("step-finish")),
    }
}

impl Tailer for DirectoryTailer {
    fn read_new(&mut self) -> Vec<Value> {
        let mut new_entries = Vec::new();

        for file in self.message_files() {
            let msg_id = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if self.seen_messages.contains(&msg_id) {
                continue;
            }
            let Some(entry) = self.read_entry(&file) else {
                continue;
            };
            let parts = entry["parts"].as_array().cloned().unwrap_or_default();
            if is_ready(&entry["info"], &parts) {
                self.seen_messages.insert(msg_id);
                new_entries.push(entry);
            }
        }

        // message_files() is sorted, so emission order follows message ids.
        self.update_waiting_state(&new_entries);
        new_entries
    }

    fn read_all(&mut self) -> Vec<Value> {
        let entries: Vec<Value> = self
            .message_files()
            .iter()
            .filter_map(|f| self.read_entry(f))
            .collect();
        self.update_waiting_state(&entries);
        entries
    }

    fn seek_to_end(&mut self) {
        // Fast initialization: mark existing message ids as seen without
        // reading their content.
        for file in self.message_files() {
            if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                self.seen_messages.insert(stem.to_string());
            }
        }
    }

    fn waiting_for_input(&self) -> bool {
        self.waiting_for_input
    }

    fn first_timestamp(&self) -> Option<String> {
        let first = self.message_files().into_iter().next()?;
        let info: Value = serde_json::from_str(&std::fs::read_to_string(first).ok()?).ok()?;
        let created = info.pointer("/time/created").and_then(Value::as_f64)?;
        format_unix_ms(created)
    }

    fn last_message_timestamp(&self) -> Option<f64> {
        let last = self.message_files().into_iter().next_back()?;
        let info: Value = serde_json::from_str(&std::fs::read_to_string(last).ok()?).ok()?;
        let ms = info
            .pointer("/time/updated")
            .and_then(Value::as_f64)
            .or_else(|| info.pointer("/time/created").and_then(Value::as_f64))?;
        Some(ms / 1000.0)
    }
}

/// Unix milliseconds to ISO-8601.
pub fn format_unix_ms(ms: f64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ms as i64).map(|dt| dt.to_rfc3339())
}
