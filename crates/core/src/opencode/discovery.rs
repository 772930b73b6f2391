// crates/core/src/opencode/discovery.rs
//! Session discovery for OpenCode's directory-of-JSON storage.
//!
//! Layout under the storage root:
//!   session/<project>/<session_id>.json   session metadata
//!   message/<session_id>/<message_id>.json
//!   part/<message_id>/<part_id>.json

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;

use crate::error::DiscoveryError;

/// Default OpenCode storage directory.
pub fn default_storage_dir() -> Result<PathBuf, DiscoveryError> {
    let home = dirs::home_dir().ok_or(DiscoveryError::HomeDirNotFound)?;
    Ok(home
        .join(".local")
        .join("share")
        .join("opencode")
        .join("storage"))
}

/// Session id is the filename without extension.
pub fn session_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Message directory for a session.
pub fn message_dir(storage_dir: &Path, session_id: &str) -> PathBuf {
    storage_dir.join("message").join(session_id)
}

/// Part directory for a message.
pub fn part_dir(storage_dir: &Path, message_id: &str) -> PathBuf {
    storage_dir.join("part").join(message_id)
}

/// Recently modified sessions with at least one message, newest first.
///
/// # Errors
/// Returns a `DiscoveryError` when the session root itself cannot be read.
/// Errors on individual project directories and files are skipped.
pub fn find_recent_sessions(
    storage_dir: &Path,
    limit: usize,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let session_root = storage_dir.join("session");
    let projects =
        std::fs::read_dir(&session_root).map_err(|e| DiscoveryError::io(&session_root, e))?;

    let mut sessions: Vec<(PathBuf, SystemTime)> = Vec::new();
    for project in projects.flatten() {
        let Ok(files) = std::fs::read_dir(project.path()) else {
            continue;
        };
        for entry in files.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            sessions.push((path, mtime));
        }
    }

    sessions.sort_by(|a, b| b.1.cmp(&a.1));

    let mut result = Vec::new();
    for (path, _) in sessions {
        if has_messages(&path, storage_dir) {
            result.push(path);
            if result.len() >= limit {
                break;
            }
        }
    }
    Ok(result)
}

/// True when the session's message directory holds at least one
/// user/assistant message.
pub fn has_messages(session_path: &Path, storage_dir: &Path) -> bool {
    let sid = session_id(session_path);
    let msg_dir = message_dir(storage_dir, &sid);
    let Ok(entries) = std::fs::read_dir(&msg_dir) else {
        return false;
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
        if matches!(
            msg.get("role").and_then(Value::as_str),
            Some("user") | Some("assistant")
        ) {
            return true;
        }
    }
    false
}

/// Project name and path from the session metadata JSON.
///
/// The session file records the working `directory`; the display name is its
/// last component. Falls back to the session `title` or id.
pub fn project_info(session_path: &Path) -> (String, Option<String>) {
    let data = std::fs::read_to_string(session_path)
        .ok()
        .and_then(|t| serde_json::from_str::<Value>(&t).ok());

    if let Some(data) = &data {
        if let Some(directory) = data.get("directory").and_then(Value::as_str) {
            let name = Path::new(directory)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(directory)
                .to_string();
            return (name, Some(directory.to_string()));
        }
        if let Some(title) = data.get("title").and_then(Value::as_str) {
            return (title.to_string(), None);
        }
    }

    (session_id(session_path), None)
}

/// First user message text, truncated for display.
pub fn first_message_preview(storage_dir: &Path, sid: &str) -> Option<String> {
    let msg_dir = message_dir(storage_dir, sid);
    let mut files: Vec<PathBuf> = std::fs::read_dir(&msg_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    for file in files {
        let Ok(text) = std::fs::read_to_string(&file) else {
            continue;
        };
        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if msg.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(message_id) = msg.get("id").and_then(Value::as_str) else {
            continue;
        };
        for part in read_parts(storage_dir, message_id) {
            if part.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        const MAX: usize = 200;
                        return Some(text.chars().take(MAX).collect());
                    }
                }
            }
        }
    }
    None
}

/// All parts for a message, sorted by part id.
pub fn read_parts(storage_dir: &Path, message_id: &str) -> Vec<Value> {
    let dir = part_dir(storage_dir, message_id);
    let mut parts: Vec<Value> = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return parts;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|t| serde_json::from_str::<Value>(&t).map_err(|e| e.to_string()))
        {
            Ok(part) => parts.push(part),
            Err(e) => tracing::warn!("Failed to read part file {}: {e}", path.display()),
        }
    }
    parts.sort_by(|a, b| {
        let ka = a.get("id").and_then(Value::as_str).unwrap_or("");
        let kb = b.get("id").and_then(Value::as_str).unwrap_or("");
        ka.cmp(kb)
    });
    parts
}

/// Watch message and part JSON files; session metadata files are not
/// watched (new sessions surface through their message files).
pub fn should_watch_file(storage_dir: &Path, path: &Path) -> bool {
    if !path.starts_with(storage_dir) {
        return false;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return false;
    }
    matches!(bucket_of(path).as_deref(), Some("message") | Some("part"))
}

/// The storage bucket (`message`, `part`, `session`) a file lives in.
fn bucket_of(path: &Path) -> Option<String> {
    path.parent()?
        .parent()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}

/// Map a changed message or part file back to its session id.
///
/// Message paths carry the session id as their directory name; part files
/// must be read because only their JSON records the owning session.
pub fn session_id_from_file_path(path: &Path, _storage_dir: &Path) -> Option<String> {
    match bucket_of(path)?.as_str() {
        "message" => path
            .parent()?
            .file_name()?
            .to_str()
            .map(str::to_string),
        "part" => {
            let text = std::fs::read_to_string(path).ok()?;
            let part: Value = serde_json::from_str(&text).ok()?;
            part.get("sessionID")
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        _ => None,
    }
}
