// crates/core/src/claude_code/tailer.rs
//! Incremental reader for JSONL transcripts.
//!
//! The tailer keeps a byte offset and a partial-line buffer so that a line
//! appended across two writes is emitted exactly once, after it completes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::backend::Tailer;

/// First user message of a warm-up/benchmark session.
pub const WARMUP_SENTINEL: &str = "Warmup";

/// Tail a JSONL session file, yielding new complete message records.
pub struct JsonlTailer {
    path: PathBuf,
    /// Byte position of the next read.
    position: u64,
    /// Incomplete trailing line carried between reads.
    buffer: String,
    waiting_for_input: bool,
}

impl JsonlTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
            buffer: String::new(),
            waiting_for_input: false,
        }
    }

    /// Read from the stored offset to EOF and split out complete lines.
    fn read_chunk(&mut self) -> Vec<String> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Cannot open {}: {e}", self.path.display());
                return Vec::new();
            }
        };

        if file.seek(SeekFrom::Start(self.position)).is_err() {
            return Vec::new();
        }

        let mut content = String::new();
        match file.read_to_string(&mut content) {
            Ok(read) => self.position += read as u64,
            Err(e) => {
                tracing::warn!("Error reading {}: {e}", self.path.display());
                return Vec::new();
            }
        }

        if content.is_empty() {
            return Vec::new();
        }

        self.buffer.push_str(&content);
        let mut lines: Vec<String> = self.buffer.split('\n').map(str::to_string).collect();
        // The last fragment (possibly empty) stays buffered until its newline arrives.
        self.buffer = lines.pop().unwrap_or_default();
        lines
    }
}

impl Tailer for JsonlTailer {
    fn read_new(&mut self) -> Vec<Value> {
        let lines = self.read_chunk();
        let mut results = Vec::new();

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(obj) => {
                    if is_message_record(&obj) {
                        results.push(obj);
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping malformed JSON line in {}: {e}", self.path.display());
                }
            }
        }

        if let Some(last) = results.last() {
            self.waiting_for_input = record_waits_for_input(last);
        }
        results
    }

    fn read_all(&mut self) -> Vec<Value> {
        // A fresh tailer replays from byte zero without touching our cursor.
        let mut fresh = JsonlTailer::new(&self.path);
        fresh.read_new()
    }

    fn seek_to_end(&mut self) {
        // Fast initialization: no content is parsed. The waiting flag stays
        // false until the first read observes the tail.
        self.position = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self.buffer.clear();
    }

    fn waiting_for_input(&self) -> bool {
        self.waiting_for_input
    }

    fn first_timestamp(&self) -> Option<String> {
        for_each_record(&self.path, |obj| {
            obj.get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }

    fn last_message_timestamp(&self) -> Option<f64> {
        let mut last: Option<f64> = None;
        for_each_record(&self.path, |obj| {
            if let Some(ts) = obj
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_iso_to_unix)
            {
                last = Some(ts);
            }
            None::<()>
        });
        last
    }
}

/// Keep only user/assistant records; everything else (system, summary,
/// progress markers) is transcript bookkeeping.
fn is_message_record(obj: &Value) -> bool {
    matches!(
        obj.get("type").and_then(Value::as_str),
        Some("user") | Some("assistant")
    )
}

/// Waiting iff the record is an assistant message whose final content block
/// is text (a tool_use tail means the turn is still running).
fn record_waits_for_input(obj: &Value) -> bool {
    if obj.get("type").and_then(Value::as_str) != Some("assistant") {
        return false;
    }
    let content = obj.pointer("/message/content");
    match content {
        Some(Value::String(_)) => true,
        Some(Value::Array(blocks)) => blocks
            .last()
            .and_then(|b| b.get("type"))
            .and_then(Value::as_str)
            .map(|t| t == "text")
            .unwrap_or(false),
        _ => false,
    }
}

/// Scan records from the start of the file until `f` returns Some.
fn for_each_record<T>(path: &Path, mut f: impl FnMut(&Value) -> Option<T>) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if !is_message_record(&obj) {
            continue;
        }
        if let Some(out) = f(&obj) {
            return Some(out);
        }
    }
    None
}

/// Parse an ISO-8601 timestamp into Unix seconds.
pub fn parse_iso_to_unix(ts: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

/// True when the file contains at least one user/assistant record.
pub fn has_messages(path: &Path) -> bool {
    for_each_record(path, |_| Some(())).is_some()
}

/// Extract the text of a user record's content (string form or first text
/// block). Tool-result-only user records yield None.
fn user_text(obj: &Value) -> Option<String> {
    if obj.get("type").and_then(Value::as_str) != Some("user") {
        return None;
    }
    match obj.pointer("/message/content") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Array(blocks)) => blocks.iter().find_map(|b| {
            if b.get("type").and_then(Value::as_str) == Some("text") {
                b.get("text").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// First real user message of a session.
pub fn first_user_message(path: &Path) -> Option<String> {
    for_each_record(path, user_text)
}

/// Warm-up sessions are created by the CLI for benchmarking and must never
/// be tracked. Their first user message equals the sentinel exactly.
pub fn is_warmup_session(path: &Path) -> bool {
    first_user_message(path).as_deref() == Some(WARMUP_SENTINEL)
}
