// crates/server/src/summarizer.rs
//! Background session summarization.
//!
//! A summary job resumes the session in the CLI's no-persist mode with a
//! summary prompt and JSON output, parses the response object, and writes
//! it to the sidecar next to the transcript. Jobs are triggered on child
//! exit (no sidecar yet, or a long run) and after idle periods.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use tailboard_core::{summary_sidecar_path, Backend, CommandOptions, OutputFormat};

use crate::config::Config;
use crate::state::AppState;

/// Hard timeout for one summary child.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(300);

/// Prompt template; placeholders are substituted per session.
const DEFAULT_PROMPT: &str = "\
Review this conversation and produce a JSON object describing it. \
Respond with ONLY the JSON object, no surrounding text. Fields: \
\"title\" (at most 8 words), \"short_summary\" (1-2 sentences), \
\"executive_summary\" (one paragraph covering goal, approach, and state), \
\"branch\" (the git branch worked on, or null). \
Session {session_id} in {project_path}, started {session_started_at}, \
summarized {generated_at}.";

impl Config {
    /// Summarization runs only when some trigger is configured.
    pub fn summaries_enabled(&self) -> bool {
        self.summarize_after_idle_s.is_some()
            || self.summary_after_long_running_s.is_some()
            || self.summary_log_path.is_some()
    }
}

/// Generate and persist a summary for one session. Returns true on success.
pub async fn summarize_session(
    state: &Arc<AppState>,
    session_id: &str,
    model: Option<String>,
) -> bool {
    let (path, project_path, started_at) = {
        let inner = state.registry.lock().await;
        let Some(session) = inner.get(session_id) else {
            return false;
        };
        (
            session.path.clone(),
            session.project_path.clone(),
            session.tailer.first_timestamp(),
        )
    };

    let Some(backend) = state.multi.backend_for_session(&path) else {
        return false;
    };
    let Some(no_persist) = backend.no_persist_flag() else {
        tracing::debug!("Backend {} cannot summarize without persisting", backend.name());
        return false;
    };

    let prompt = DEFAULT_PROMPT
        .replace("{session_id}", session_id)
        .replace(
            "{project_path}",
            if project_path.is_empty() {
                "Unknown"
            } else {
                &project_path
            },
        )
        .replace(
            "{session_started_at}",
            started_at.as_deref().unwrap_or("Unknown"),
        )
        .replace("{generated_at}", &chrono::Utc::now().to_rfc3339());

    let opts = CommandOptions {
        skip_permissions: true,
        output_format: Some(OutputFormat::Json),
        add_dirs: Vec::new(),
    };
    let mut spec = backend.build_send_command(session_id, &prompt, &opts);
    spec.args.push(no_persist.to_string());
    if let Some(model) = &model {
        spec.args.extend(backend.model_args(model));
    }

    tracing::debug!(session_id = %session_id, model = ?model, "Running summary command");

    let cwd = Some(PathBuf::from(&project_path))
        .filter(|p| !project_path.is_empty() && p.is_dir());

    let raw_response = match run_summary_child(&spec.args, spec.stdin.as_deref(), cwd, state).await
    {
        Ok(stdout) => stdout,
        Err(e) => {
            tracing::error!(session_id = %session_id, "Summary command failed: {e}");
            return false;
        }
    };

    let Some(mut summary) = parse_summary_response(&raw_response) else {
        tracing::error!(session_id = %session_id, "Failed to parse summary response");
        return false;
    };

    let sidecar = summary_sidecar_path(&path);
    // raw_response is debug-only; never surfaced in events or REST.
    let mut sidecar_doc = summary.clone();
    sidecar_doc["raw_response"] = json!(raw_response);
    match serde_json::to_string_pretty(&sidecar_doc) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&sidecar, text) {
                tracing::warn!("Failed to write summary sidecar: {e}");
                return false;
            }
        }
        Err(e) => {
            tracing::warn!("Failed to serialize summary: {e}");
            return false;
        }
    }

    if let Some(log_path) = &state.config.summary_log_path {
        summary["summary_file"] = json!(sidecar.to_string_lossy());
        summary["session_last_updated_at"] = json!(chrono::Utc::now().to_rfc3339());
        append_summary_log(log_path, &summary);
    }

    tracing::info!(
        session_id = %session_id,
        title = %summary.get("title").and_then(serde_json::Value::as_str).unwrap_or("No title"),
        "Session summarized"
    );

    // Reload the sidecar into the session and notify clients. The watcher
    // fires for the sidecar write too; both paths converge here.
    state.process_session_summary_update(session_id).await;
    mark_session_summarized(state, session_id);
    true
}

/// Triggers evaluated when a session's child exits: first summary for a
/// session with no sidecar, then re-summaries after long runs.
pub async fn maybe_schedule_summary(
    state: &Arc<AppState>,
    session_id: &str,
    duration: Duration,
) {
    if !state.config.summaries_enabled() {
        return;
    }

    let (path, sidecar_exists) = {
        let inner = state.registry.lock().await;
        let Some(session) = inner.get(session_id) else {
            return;
        };
        (session.path.clone(), session.summary_path().exists())
    };

    let reason = if !sidecar_exists {
        "new session"
    } else if state
        .config
        .summary_after_long_running_s
        .map(|t| duration.as_secs() >= t)
        .unwrap_or(false)
    {
        "long-running"
    } else {
        return;
    };

    // The session's own model keeps the summary on the warm prompt cache.
    let model = state
        .multi
        .backend_for_session(&path)
        .and_then(|b| b.get_model(&path));

    tracing::info!(
        session_id = %session_id,
        reason,
        model = ?model,
        "Triggering summary"
    );
    let state = state.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        summarize_session(&state, &session_id, model).await;
    });
}

/// Reschedule the idle summary for a session that just saw activity.
pub fn on_session_activity(state: &Arc<AppState>, session_id: &str) {
    let Some(idle_s) = state.config.summarize_after_idle_s else {
        return;
    };

    let mut jobs = state.idle_jobs.lock().unwrap();
    if let Some(job) = jobs.remove(session_id) {
        job.abort();
    }

    let state_task = state.clone();
    let id = session_id.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(idle_s)).await;
        let model = state_task.config.idle_summary_model.clone();
        summarize_session(&state_task, &id, Some(model)).await;
        state_task.idle_jobs.lock().unwrap().remove(&id);
    });
    jobs.insert(session_id.to_string(), handle);
}

/// Cancel any pending idle job after a summary completed.
pub fn mark_session_summarized(state: &Arc<AppState>, session_id: &str) {
    if let Some(job) = state.idle_jobs.lock().unwrap().remove(session_id) {
        job.abort();
    }
}

/// Spawn the summary CLI and collect stdout under the hard timeout.
async fn run_summary_child(
    args: &[String],
    stdin_payload: Option<&str>,
    cwd: Option<PathBuf>,
    state: &AppState,
) -> Result<String, String> {
    let program = args.first().ok_or("empty argv")?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(&args[1..])
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    if let Some(budget) = state.config.thinking_budget {
        cmd.env("MAX_THINKING_TOKENS", budget.to_string());
    }
    // A timed-out child must not outlive its dropped future.
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            "CLI not found".to_string()
        } else {
            e.to_string()
        }
    })?;

    if let (Some(payload), Some(mut stdin)) = (stdin_payload, child.stdin.take()) {
        let payload = payload.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
        });
    }

    match tokio::time::timeout(SUMMARY_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if !output.status.success() {
                return Err(format!(
                    "exit code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("Command timed out".into()),
    }
}

/// Parse the CLI's JSON output: find the `result` record, then the
/// outermost `{...}` inside its text (models wrap JSON in code fences).
fn parse_summary_response(raw: &str) -> Option<Value> {
    let mut response_text = None;
    for line in raw.lines() {
        let Ok(obj) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) == Some("result") {
            response_text = obj
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string);
            break;
        }
    }
    let text = response_text?;

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;
    parsed.is_object().then_some(parsed)
}

fn append_summary_log(path: &PathBuf, entry: &Value) {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{entry}"));
    if let Err(e) = result {
        tracing::warn!("Failed to append summary log: {e}");
    }
}
