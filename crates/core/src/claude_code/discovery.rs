// crates/core/src/claude_code/discovery.rs
//! Session discovery for the Claude Code JSONL layout.
//!
//! Sessions live at `~/.claude/projects/<encoded-project-dir>/<uuid>.jsonl`.
//! The encoded directory name replaces every `/`, `.` and `_` of the
//! original project path with `-`, which makes decoding ambiguous; we probe
//! the filesystem to find the real directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use super::tailer::{first_user_message, has_messages, is_warmup_session};
use crate::error::DiscoveryError;

/// Default location for Claude Code projects.
pub fn default_projects_dir() -> Result<PathBuf, DiscoveryError> {
    let home = dirs::home_dir().ok_or(DiscoveryError::HomeDirNotFound)?;
    Ok(home.join(".claude").join("projects"))
}

/// Subagent sessions are `agent-*.jsonl` files.
pub fn is_subagent_session(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("agent-"))
        .unwrap_or(false)
}

/// Parent session id for a subagent transcript.
///
/// Subagents are stored at
/// `<project>/<parent-uuid>/subagents/agent-<id>.jsonl`.
pub fn parent_session_id(path: &Path) -> Option<String> {
    if !is_subagent_session(path) {
        return None;
    }
    let parent = path.parent()?;
    if parent.file_name()?.to_str()? != "subagents" {
        return None;
    }
    Some(parent.parent()?.file_name()?.to_str()?.to_string())
}

/// Session id is the filename without extension.
pub fn session_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Decode an encoded project directory name to `(project_name, project_path)`.
///
/// Every `/`, `.` and `_` in the original path became a `-`, so candidates
/// are generated by turning dashes back into separators, preferring runs at
/// the end of the name (the project name is the last component), and the
/// first candidate that exists on disk wins. `--` additionally stands for
/// `/.` (dotfile directories). Falls back to the encoded name itself.
pub fn decode_project_dir(encoded: &str) -> (String, String) {
    let folder = encoded.trim_start_matches('-').to_string();

    let mut variants = vec![folder.clone()];
    if folder.contains("--") {
        variants.push(folder.replace("--", "-."));
    }

    for variant in &variants {
        let dash_positions: Vec<usize> = variant
            .char_indices()
            .filter(|(_, c)| *c == '-')
            .map(|(i, _)| i)
            .collect();

        for num_seps in (1..=dash_positions.len()).rev() {
            for start in 0..=(dash_positions.len() - num_seps) {
                let mut candidate: Vec<char> = variant.chars().collect();
                for &pos in &dash_positions[start..start + num_seps] {
                    candidate[pos] = '/';
                }
                let candidate_path = format!("/{}", candidate.iter().collect::<String>());
                if Path::new(&candidate_path).is_dir() {
                    let name = Path::new(&candidate_path)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or(&candidate_path)
                        .to_string();
                    return (name, candidate_path);
                }

                // Remaining dashes may have been underscores originally.
                let underscored: String = candidate
                    .iter()
                    .map(|&c| if c == '-' { '_' } else { c })
                    .collect();
                let underscored_path = format!("/{underscored}");
                if Path::new(&underscored_path).is_dir() {
                    let name = Path::new(&underscored_path)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or(&underscored_path)
                        .to_string();
                    return (name, underscored_path);
                }
            }
        }
    }

    // Nothing on disk matched. Strip a `Users-<name>-`/`home-<name>-`
    // prefix for a friendlier display name; the path stays encoded.
    let re = regex_lite::Regex::new(r"^(?:Users|home)-[^-]+-(.+)$").unwrap();
    let name = re
        .captures(&folder)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| folder.clone());
    (name, folder)
}

/// Project name and path for a session file.
///
/// For subagent transcripts the project folder is two levels further up.
pub fn project_info(session_path: &Path) -> (String, String) {
    let mut parent = session_path.parent();
    if parent
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        == Some("subagents")
    {
        parent = parent.and_then(|p| p.parent()).and_then(|p| p.parent());
    }

    let encoded = parent
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");

    decode_project_dir(encoded)
}

/// Find the most recently modified session files that have messages.
///
/// Zero-byte files, message-less files, and warm-up sessions are excluded.
/// The mtime sort happens before the (expensive) message check so that the
/// limit short-circuits the scan.
///
/// # Errors
/// Returns a `DiscoveryError` when the projects directory itself cannot be
/// read. Errors on individual project directories and files are skipped.
pub fn find_recent_sessions(
    projects_dir: &Path,
    limit: usize,
    include_subagents: bool,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let projects = std::fs::read_dir(projects_dir)
        .map_err(|e| DiscoveryError::io(projects_dir, e))?;

    let mut sessions: Vec<(PathBuf, SystemTime)> = Vec::new();
    for project in projects.flatten() {
        // Subagent transcripts nest below the project directory, so each
        // project is walked recursively.
        for entry in WalkDir::new(project.path())
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if !include_subagents && is_subagent_session(path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() == 0 {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            sessions.push((path.to_path_buf(), mtime));
        }
    }

    sessions.sort_by(|a, b| b.1.cmp(&a.1));

    let mut result = Vec::new();
    for (path, _) in sessions {
        if has_messages(&path) && !is_warmup_session(&path) {
            result.push(path);
            if result.len() >= limit {
                break;
            }
        }
    }
    Ok(result)
}

/// Whether a file is a transcript or sidecar this backend watches.
pub fn should_watch_file(path: &Path, include_subagents: bool) -> bool {
    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        if !include_subagents && is_subagent_session(path) {
            return false;
        }
        return true;
    }
    is_summary_file(path)
}

/// Sidecar summary files are `<session_id>_summary.json`.
pub fn is_summary_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with("_summary.json"))
        .unwrap_or(false)
}

/// Session id owning a sidecar summary file.
pub fn session_id_from_summary_file(path: &Path) -> Option<String> {
    if !is_summary_file(path) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_end_matches("_summary").to_string())
}

/// First user message preview, truncated for display.
pub fn first_message_preview(path: &Path) -> Option<String> {
    let text = first_user_message(path)?;
    const MAX: usize = 200;
    if text.chars().count() <= MAX {
        Some(text)
    } else {
        Some(text.chars().take(MAX).collect())
    }
}
