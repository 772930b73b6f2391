// crates/server/src/permissions.rs
//! Permission-denial interception and the grant flow.
//!
//! A CLI run in machine-readable mode streams newline-delimited JSON; the
//! final `result` record carries a `permission_denials` array. Each denial
//! is enriched with the matching tool error message and classified as a
//! sandbox denial (blocked directory, fixed via the allow-list) or a tool
//! permission denial (fixed by a grant in the project settings file).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Substrings that mark a sandbox/directory restriction rather than a tool
/// permission denial.
const SANDBOX_DENIAL_PATTERNS: &[&str] = &[
    "was blocked. For security, Claude Code may only",
    "only list files in the allowed working directories",
    "only access files within",
];

/// One permission denial from the CLI's result record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionDenial {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub is_sandbox_denial: bool,
}

/// Whether an error message indicates a sandbox/directory denial.
pub fn is_sandbox_denial_message(message: &str) -> bool {
    SANDBOX_DENIAL_PATTERNS.iter().any(|p| message.contains(p))
}

/// Parse the CLI's streamed output for permission denials.
///
/// Two passes: collect tool error text keyed by tool_use_id, then take the
/// `result` record's `permission_denials` and enrich each entry.
pub fn parse_permission_denials(stdout: &str) -> Vec<PermissionDenial> {
    let mut tool_errors: HashMap<String, String> = HashMap::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(blocks) = obj.pointer("/message/content").and_then(Value::as_array) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            if !block.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let Some(tool_id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            let content = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            tool_errors.insert(tool_id.to_string(), content);
        }
    }

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("result") {
            continue;
        }
        let raw = obj
            .get("permission_denials")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return raw
            .into_iter()
            .map(|d| {
                let tool_use_id = d
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let error_message = tool_errors.get(&tool_use_id).cloned().unwrap_or_default();
                PermissionDenial {
                    tool_name: d
                        .get("tool_name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    is_sandbox_denial: is_sandbox_denial_message(&error_message),
                    tool_use_id,
                    tool_input: d.get("tool_input").cloned().unwrap_or(Value::Null),
                    error_message,
                }
            })
            .collect();
    }

    Vec::new()
}

/// One grant option offered to the user, most specific first.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PermissionOption {
    pub label: String,
    /// Grant string written into the settings file, e.g. "Bash(npm test:*)".
    pub value: String,
    pub example: String,
}

/// Grant options for a denied tool call.
pub fn generate_permission_options(tool_name: &str, tool_input: &Value) -> Vec<PermissionOption> {
    match tool_name {
        "Bash" => {
            let command = tool_input
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let words: Vec<&str> = command.split_whitespace().collect();
            let first_word = words.first().copied().unwrap_or(command);
            let first_two = if words.len() >= 2 {
                format!("{} {}", words[0], words[1])
            } else {
                command.to_string()
            };

            let mut options = vec![PermissionOption {
                label: "Allow this exact command".into(),
                value: format!("Bash({command})"),
                example: command.to_string(),
            }];
            if words.len() >= 2 {
                options.push(PermissionOption {
                    label: "Allow with any arguments".into(),
                    value: format!("Bash({first_two}:*)"),
                    example: format!("{first_two} ..."),
                });
            }
            options.push(PermissionOption {
                label: format!("Allow all {first_word} commands"),
                value: format!("Bash({first_word}:*)"),
                example: format!("{first_word} ..."),
            });
            options
        }
        "Read" | "Write" | "Edit" => {
            let file_path = tool_input
                .get("file_path")
                .or_else(|| tool_input.get("path"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            vec![
                PermissionOption {
                    label: "Allow this exact file".into(),
                    value: format!("{tool_name}({file_path})"),
                    example: file_path.to_string(),
                },
                PermissionOption {
                    label: format!("Allow all {tool_name} operations"),
                    value: tool_name.to_string(),
                    example: "Any file".into(),
                },
            ]
        }
        other => vec![PermissionOption {
            label: format!("Allow {other}"),
            value: other.to_string(),
            example: "All operations".into(),
        }],
    }
}

/// Wire form of a denial list: each denial carries its grant options so
/// the UI can offer exact-command through tool-wide choices directly.
pub fn denials_to_wire(denials: &[PermissionDenial]) -> Value {
    Value::Array(
        denials
            .iter()
            .map(|d| {
                let mut wire = serde_json::to_value(d).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut wire {
                    let options = generate_permission_options(&d.tool_name, &d.tool_input);
                    map.insert(
                        "options".into(),
                        serde_json::to_value(options).unwrap_or(Value::Null),
                    );
                }
                wire
            })
            .collect(),
    )
}

/// Merge grant strings into a project settings file.
///
/// Creates the file and parents as needed; preserves unrelated keys and
/// existing grants; skips duplicates. Unreadable JSON is replaced.
pub fn update_permissions_file(
    settings_path: &Path,
    new_permissions: &[String],
) -> std::io::Result<()> {
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut settings: Value = std::fs::read_to_string(settings_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({}));
    if !settings.is_object() {
        tracing::warn!("Invalid JSON in {}, recreating", settings_path.display());
        settings = json!({});
    }

    let permissions = settings
        .as_object_mut()
        .unwrap()
        .entry("permissions")
        .or_insert_with(|| json!({}));
    if !permissions.is_object() {
        *permissions = json!({});
    }
    let allow = permissions
        .as_object_mut()
        .unwrap()
        .entry("allow")
        .or_insert_with(|| json!([]));
    if !allow.is_array() {
        *allow = json!([]);
    }
    let list = allow.as_array_mut().unwrap();

    let mut added = Vec::new();
    for perm in new_permissions {
        if !list.iter().any(|v| v.as_str() == Some(perm)) {
            list.push(json!(perm));
            added.push(perm.clone());
        }
    }

    if added.is_empty() {
        tracing::debug!("All permissions already exist in {}", settings_path.display());
        return Ok(());
    }

    tracing::info!("Adding permissions to {}: {added:?}", settings_path.display());
    let mut text = serde_json::to_string_pretty(&settings)?;
    text.push('\n');
    std::fs::write(settings_path, text)
}

/// Path to the settings file grants are written into.
pub fn project_settings_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".claude").join("settings.json")
}

/// Persistent sandbox allow-list, stored in the user config directory.
pub struct AllowedDirectories {
    path: PathBuf,
    dirs: std::sync::Mutex<Vec<String>>,
}

impl AllowedDirectories {
    /// Default store at `~/.config/tailboard/allowed-dirs.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("tailboard")
            .join("allowed-dirs.json")
    }

    /// Load (or start empty when missing/corrupt).
    pub fn load(path: PathBuf) -> Self {
        let dirs = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|v| {
                v.get("directories").and_then(Value::as_array).map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
            })
            .unwrap_or_default();
        Self {
            path,
            dirs: std::sync::Mutex::new(dirs),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.dirs.lock().unwrap().clone()
    }

    /// Add a directory and persist the sorted list.
    pub fn add(&self, directory: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        if !dirs.iter().any(|d| d == directory) {
            dirs.push(directory.to_string());
            dirs.sort();
        }
        let snapshot = dirs.clone();
        drop(dirs);
        self.save(&snapshot);
    }

    fn save(&self, dirs: &[String]) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&json!({ "directories": dirs })) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    tracing::error!("Failed to save allowed directories: {e}");
                }
            }
            Err(e) => tracing::error!("Failed to serialize allowed directories: {e}"),
        }
    }
}
