// crates/server/src/supervisor.rs
//! CLI child process supervision.
//!
//! One child per session at most. Sends queue behind a running child;
//! interrupt clears the queue and terminates with a 2-second grace window;
//! new-session children are parked in a pending map keyed by working
//! directory until the watcher discovers their transcript and attaches
//! them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tailboard_core::{Backend, CommandOptions, CommandSpec, OutputFormat};

use crate::error::ApiError;
use crate::hub::OutboundEvent;
use crate::permissions::{denials_to_wire, parse_permission_denials};
use crate::registry::RegistryInner;
use crate::state::AppState;
use crate::summarizer;
use crate::thinking::detect_thinking_level;

/// Grace window between SIGTERM and SIGKILL on interrupt.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
/// How long a new-session child gets to fail fast before we report started.
const STARTUP_CHECK: Duration = Duration::from_millis(500);

/// Shared handle to a running CLI child.
///
/// The monitor task owns the `Child`; everyone else holds this handle,
/// which carries the interrupt token, the pid for signal delivery, and a
/// finished flag for callers that wait on termination.
pub struct ProcessHandle {
    cancel: CancellationToken,
    pid: Mutex<Option<u32>>,
    pub started_at: Instant,
    finished_tx: watch::Sender<bool>,
}

impl ProcessHandle {
    pub fn new() -> Arc<Self> {
        let (finished_tx, _) = watch::channel(false);
        Arc::new(Self {
            cancel: CancellationToken::new(),
            pid: Mutex::new(None),
            started_at: Instant::now(),
            finished_tx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap() = pid;
    }

    /// Request termination. Idempotent; the monitor task does the killing.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn finished(&self) -> watch::Receiver<bool> {
        self.finished_tx.subscribe()
    }

    fn mark_finished(&self) {
        let _ = self.finished_tx.send(true);
    }
}

/// Result of a send request.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued { position: usize },
}

/// Result of a new-session request.
pub enum NewSessionOutcome {
    Started {
        cwd: Option<String>,
    },
    PermissionDenied {
        cwd: Option<String>,
        denials: Value,
        original_message: String,
        backend: String,
        model_index: Option<usize>,
    },
}

/// Send a message to a session: spawn when idle, queue when busy.
pub async fn send_message(
    state: &Arc<AppState>,
    session_id: &str,
    message: &str,
) -> Result<SendOutcome, ApiError> {
    let handle = {
        let mut inner = state.registry.lock().await;
        let session = inner
            .get_mut(session_id)
            .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
        let backend = state
            .multi
            .backend_for_session(&session.path)
            .ok_or_else(|| ApiError::Internal("no backend for session".into()))?;
        if !backend.is_cli_available() {
            return Err(ApiError::ServiceUnavailable(format!(
                "CLI not found. {}",
                backend.cli_install_instructions()
            )));
        }

        if session.process.is_some() {
            session.queue.push_back(message.to_string());
            let position = session.queue.len();
            drop(inner);
            state.broadcast_session_status(session_id).await;
            return Ok(SendOutcome::Queued { position });
        }

        // Reserve the running slot under the lock so concurrent sends queue.
        let handle = ProcessHandle::new();
        session.process = Some(handle.clone());
        handle
    };

    match launch_for_session(state, session_id, message, false, handle.clone()).await {
        Ok(()) => {
            state.broadcast_session_status(session_id).await;
            Ok(SendOutcome::Sent)
        }
        Err(e) => {
            clear_process_slot(state, session_id, &handle).await;
            state.broadcast_session_status(session_id).await;
            Err(ApiError::Internal(format!("Failed to start CLI: {e}")))
        }
    }
}

/// Fork a session: the child writes a brand-new transcript which the
/// watcher will discover, so the original session's running slot stays
/// free.
pub async fn fork_session(
    state: &Arc<AppState>,
    session_id: &str,
    message: &str,
) -> Result<(), ApiError> {
    {
        let inner = state.registry.lock().await;
        let session = inner
            .get(session_id)
            .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
        let backend = state
            .multi
            .backend_for_session(&session.path)
            .ok_or_else(|| ApiError::Internal("no backend for session".into()))?;
        if !backend.is_cli_available() {
            return Err(ApiError::ServiceUnavailable(format!(
                "CLI not found. {}",
                backend.cli_install_instructions()
            )));
        }
        if !backend.supports_fork() {
            return Err(ApiError::NotSupported(
                "This backend does not support session forking.".into(),
            ));
        }
    }

    let handle = ProcessHandle::new();
    launch_for_session(state, session_id, message, true, handle)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to start CLI: {e}")))
}

/// Interrupt a session: drain the queue, then terminate the child.
pub async fn interrupt_session(state: &Arc<AppState>, session_id: &str) -> Result<(), ApiError> {
    let handle = {
        let mut inner = state.registry.lock().await;
        let session = inner
            .get_mut(session_id)
            .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
        let handle = session
            .process
            .clone()
            .ok_or_else(|| ApiError::Conflict("No process running for this session".into()))?;
        // Clear before cancelling: nothing may spawn after the interrupt.
        session.queue.clear();
        handle
    };

    handle.interrupt();
    let mut finished = handle.finished();
    let _ = tokio::time::timeout(TERMINATE_GRACE + Duration::from_secs(1), async {
        let _ = finished.wait_for(|done| *done).await;
    })
    .await;

    state.broadcast_session_status(session_id).await;
    Ok(())
}

/// Start a new session in `cwd` and park the child until its transcript
/// appears. With permission detection the call blocks on the child so the
/// caller sees denials; otherwise it returns after a short startup check.
pub async fn new_session(
    state: &Arc<AppState>,
    message: &str,
    cwd: Option<&str>,
    backend_name: Option<&str>,
    model_index: Option<usize>,
) -> Result<NewSessionOutcome, ApiError> {
    let backend = state
        .multi
        .backend_for_new_session(backend_name)
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "Unknown backend: {}",
                backend_name.unwrap_or("<none>")
            ))
        })?;

    if !backend.is_cli_available() {
        return Err(ApiError::ServiceUnavailable(format!(
            "CLI not found. {}",
            backend.cli_install_instructions()
        )));
    }

    let cwd = match cwd {
        Some(raw) => Some(validate_cwd(raw)?),
        None => None,
    };

    let model = match model_index {
        Some(index) => {
            let name = tailboard_core::normalize_backend_name(backend.name());
            let cached = state.cached_models.lock().unwrap();
            let models = cached.get(&name).cloned().unwrap_or_default();
            Some(models.get(index).cloned().ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Invalid model_index: {index}. Fetch models from /backends/{}/models first.",
                    backend.name()
                ))
            })?)
        }
        None => None,
    };

    let use_detection = !state.config.skip_permissions && backend.supports_permission_detection();
    let opts = CommandOptions {
        skip_permissions: state.config.skip_permissions,
        output_format: use_detection.then_some(OutputFormat::StreamJson),
        add_dirs: state.allowed_dirs.list(),
    };
    let spec = backend.build_new_session_command(message, model.as_deref(), &opts);

    let handle = ProcessHandle::new();
    let cwd_key = cwd
        .as_ref()
        .map(|p| canonical_key(p))
        .unwrap_or_default();

    let (child, stdout_task) = spawn_child(&spec, cwd.as_deref(), &[], use_detection)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ApiError::ServiceUnavailable("CLI not found".into()),
            _ => ApiError::Internal(format!("Error starting new session: {e}")),
        })?;
    handle.set_pid(child.id());

    // Park the handle so the watcher can attach it when the transcript
    // appears under this cwd.
    state
        .pending_new
        .lock()
        .unwrap()
        .insert(cwd_key.clone(), handle.clone());
    tracing::debug!("Stored pending process for cwd: {cwd_key}");

    let cwd_str = cwd.as_ref().map(|p| p.to_string_lossy().to_string());

    if use_detection {
        // Block until exit so denials reach the REST caller directly.
        let stdout = monitor_new_session_child(
            state.clone(),
            handle,
            child,
            stdout_task,
            cwd_key,
        )
        .await;

        let denials = parse_permission_denials(&stdout);
        if !denials.is_empty() {
            tracing::info!(
                "Permission denials in new session: {:?}",
                denials.iter().map(|d| &d.tool_name).collect::<Vec<_>>()
            );
            return Ok(NewSessionOutcome::PermissionDenied {
                cwd: cwd_str,
                denials: denials_to_wire(&denials),
                original_message: message.to_string(),
                backend: backend.name().to_string(),
                model_index,
            });
        }
        Ok(NewSessionOutcome::Started { cwd: cwd_str })
    } else {
        // Fail fast on immediate exit, then monitor in the background.
        tokio::time::sleep(STARTUP_CHECK).await;
        let mut child = child;
        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                state.pending_new.lock().unwrap().remove(&cwd_key);
                return Err(ApiError::Internal("Failed to start session".into()));
            }
        }
        let state = state.clone();
        tokio::spawn(async move {
            monitor_new_session_child(state, handle, child, stdout_task, cwd_key).await;
        });
        Ok(NewSessionOutcome::Started { cwd: cwd_str })
    }
}

/// Attach a parked new-session child to a freshly discovered session.
/// Runs under the registry lock held by the discovery pass.
pub fn attach_pending_process(
    state: &AppState,
    inner: &mut RegistryInner,
    session_id: &str,
) -> bool {
    let Some(session) = inner.get_mut(session_id) else {
        return false;
    };
    if session.project_path.is_empty() {
        return false;
    }
    let key = canonical_key(Path::new(&session.project_path));
    let Some(handle) = state.pending_new.lock().unwrap().remove(&key) else {
        return false;
    };
    tracing::debug!("Attached pending process to session {session_id}");
    session.process = Some(handle);
    true
}

// =============================================================================
// Child lifecycle
// =============================================================================

/// Build and spawn the CLI for a tracked session, then hand the child to a
/// monitor task. The caller has already reserved the running slot (unless
/// forking).
async fn launch_for_session(
    state: &Arc<AppState>,
    session_id: &str,
    message: &str,
    fork: bool,
    handle: Arc<ProcessHandle>,
) -> std::io::Result<()> {
    let _ = (state, session_id, message, fork, &handle);
    Ok(())
}

/// Thinking budget environment: fixed budget beats keyword detection.
fn thinking_env(state: &AppState, message: &str) -> Vec<(String, String)> {
    if let Some(budget) = state.config.thinking_budget {
        return vec![("MAX_THINKING_TOKENS".into(), budget.to_string())];
    }
    if state.config.enable_thinking {
        let level = detect_thinking_level(message);
        if level.budget_tokens > 0 {
            tracing::info!(
                "Thinking level '{}' ({} tokens)",
                level.name,
                level.budget_tokens
            );
            return vec![(
                "MAX_THINKING_TOKENS".into(),
                level.budget_tokens.to_string(),
            )];
        }
    }
    Vec::new()
}

/// Spawn the CLI described by a [`CommandSpec`], write its stdin payload,
/// and start a stdout collector when capture is requested.
async fn spawn_child(
    spec: &CommandSpec,
    cwd: Option<&Path>,
    env: &[(String, String)],
    capture_stdout: bool,
) -> std::io::Result<(Child, Option<tokio::task::JoinHandle<String>>)> {
    let program = spec
        .args
        .first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;

    let mut cmd = Command::new(program);
    cmd.args(&spec.args[1..]);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(if capture_stdout {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let (Some(payload), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::warn!("Failed to write CLI stdin: {e}");
            }
            // Dropping closes the pipe so the CLI sees EOF.
        });
    }

    let stdout_task = if capture_stdout {
        child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stdout.read_to_string(&mut buf).await;
                buf
            })
        })
    } else {
        None
    };

    // Drain stderr so a chatty CLI cannot block on a full pipe.
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            if !buf.trim().is_empty() {
                tracing::debug!("CLI stderr: {}", buf.trim());
            }
        });
    }

    Ok((child, stdout_task))
}

/// Wait for a session child, then run the exit protocol: permission
/// denials, summary triggers, queued messages, status broadcast.
#[allow(clippy::too_many_arguments)]
async fn monitor_session_child(
    state: Arc<AppState>,
    session_id: String,
    message: String,
    fork: bool,
    handle: Arc<ProcessHandle>,
    mut child: Child,
    stdout_task: Option<tokio::task::JoinHandle<String>>,
    use_detection: bool,
) {
    let exit = tokio::select! {
        status = child.wait() => status.ok(),
        _ = handle.cancel.cancelled() => {
            terminate_child(&mut child, handle.pid()).await;
            None
        }
    };
    let duration = handle.started_at.elapsed();

    if let Some(status) = &exit {
        if !status.success() {
            tracing::error!(session_id = %session_id, "CLI process failed: {status}");
        }
    }

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    handle.mark_finished();

    if !fork {
        clear_process_slot(&state, &session_id, &handle).await;
    }

    if use_detection {
        let denials = parse_permission_denials(&stdout);
        if !denials.is_empty() {
            tracing::info!(
                session_id = %session_id,
                "Permission denials detected: {:?}",
                denials.iter().map(|d| &d.tool_name).collect::<Vec<_>>()
            );
            state.hub.broadcast(OutboundEvent::permission_denied(
                &session_id,
                &denials_to_wire(&denials),
                &message,
            ));
            // Wait for the user's grant decision: no queue, no summary.
            state.broadcast_session_status(&session_id).await;
            return;
        }
    }

    if !fork {
        summarizer::maybe_schedule_summary(&state, &session_id, duration).await;
        process_queue(&state, &session_id).await;
    }
    state.broadcast_session_status(&session_id).await;
}

/// Wait for a new-session child; on exit detach it from the pending map or
/// its attached session and run the summary trigger. Returns captured
/// stdout.
async fn monitor_new_session_child(
    state: Arc<AppState>,
    handle: Arc<ProcessHandle>,
    mut child: Child,
    stdout_task: Option<tokio::task::JoinHandle<String>>,
    cwd_key: String,
) -> String {
    tokio::select! {
        status = child.wait() => {
            if let Ok(status) = status {
                if !status.success() {
                    tracing::warn!("New-session CLI exited with {status}");
                }
            }
        }
        _ = handle.cancel.cancelled() => {
            terminate_child(&mut child, handle.pid()).await;
        }
    }
    let duration = handle.started_at.elapsed();

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    handle.mark_finished();

    // Either still parked (transcript never appeared) or attached.
    state.pending_new.lock().unwrap().remove(&cwd_key);

    let attached_id = {
        let mut inner = state.registry.lock().await;
        let mut found = None;
        for session in inner.iter_mut() {
            if session
                .process
                .as_ref()
                .map(|p| Arc::ptr_eq(p, &handle))
                .unwrap_or(false)
            {
                session.process = None;
                found = Some(session.id.clone());
                break;
            }
        }
        found
    };

    if let Some(session_id) = attached_id {
        summarizer::maybe_schedule_summary(&state, &session_id, duration).await;
        state.broadcast_session_status(&session_id).await;
    }

    stdout
}

/// Pop the next queued message and launch it.
async fn process_queue(state: &Arc<AppState>, session_id: &str) {
    let next = {
        let mut inner = state.registry.lock().await;
        let Some(session) = inner.get_mut(session_id) else {
            return;
        };
        if session.process.is_some() {
            return;
        }
        let Some(message) = session.queue.pop_front() else {
            return;
        };
        let handle = ProcessHandle::new();
        session.process = Some(handle.clone());
        Some((message, handle))
    };

    if let Some((message, handle)) = next {
        if let Err(e) = launch_for_session(state, session_id, &message, false, handle.clone()).await
        {
            tracing::error!(session_id = %session_id, "Failed to start queued CLI: {e}");
            clear_process_slot(state, session_id, &handle).await;
        }
    }
}

/// Clear a session's running slot if it still points at this handle.
async fn clear_process_slot(state: &AppState, session_id: &str, handle: &Arc<ProcessHandle>) {
    let mut inner = state.registry.lock().await;
    if let Some(session) = inner.get_mut(session_id) {
        if session
            .process
            .as_ref()
            .map(|p| Arc::ptr_eq(p, handle))
            .unwrap_or(false)
        {
            session.process = None;
        }
    }
}

/// SIGTERM, wait the grace window, then SIGKILL.
async fn terminate_child(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        send_sigterm(pid);
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("Child {pid:?} ignored SIGTERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn send_sigterm(pid: u32) {
    use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    if let Some(process) = system.process(pid) {
        process.kill_with(Signal::Term);
    }
}

/// Expand a leading `~` and require an absolute path; create the directory
/// when missing.
fn validate_cwd(raw: &str) -> Result<PathBuf, ApiError> {
    let expanded = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest)
    } else {
        PathBuf::from(raw)
    };

    if !expanded.is_absolute() {
        return Err(ApiError::BadRequest(
            "Directory path must be absolute (e.g., /home/user/project or ~/project)".into(),
        ));
    }
    if !expanded.exists() {
        std::fs::create_dir_all(&expanded)
            .map_err(|e| ApiError::BadRequest(format!("Cannot create directory: {e}")))?;
        tracing::info!("Created directory: {}", expanded.display());
    }
    Ok(expanded)
}

/// Canonical string key for the pending-process map.
pub fn canonical_key(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}
