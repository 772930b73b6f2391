// crates/server/src/routes/sessions.rs
//! Session REST endpoints: listing, status, send/fork/interrupt,
//! summarize, new sessions, and the permission grant flow.

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use tailboard_core::Backend;

use crate::error::ApiError;
use crate::permissions::{project_settings_path, update_permissions_file};
use crate::state::AppState;
use crate::summarizer;
use crate::supervisor::{self, NewSessionOutcome, SendOutcome};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}/status", get(session_status))
        .route("/sessions/{id}/send", post(send_message))
        .route("/sessions/{id}/fork", post(fork_session))
        .route("/sessions/{id}/interrupt", post(interrupt_session))
        .route("/sessions/{id}/summarize", post(trigger_summary))
        .route("/sessions/{id}/grant-permission", post(grant_permission))
        .route("/sessions/new", post(create_new_session))
        .route("/sessions/grant-permission-new", post(grant_permission_new))
        .route("/allow-directory", post(allow_directory))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct NewSessionRequest {
    message: String,
    cwd: Option<String>,
    backend: Option<String>,
    model_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GrantPermissionRequest {
    /// Grant strings, e.g. `["Bash(npm test:*)", "Read"]`.
    permissions: Vec<String>,
    /// Message re-sent after the grants are written.
    original_message: String,
}

#[derive(Debug, Deserialize)]
struct GrantPermissionNewSessionRequest {
    permissions: Vec<String>,
    original_message: String,
    cwd: String,
    backend: Option<String>,
    model_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AllowDirectoryRequest {
    directory: String,
    add_dirs: Option<Vec<String>>,
}

fn require_send_enabled(state: &AppState) -> Result<(), ApiError> {
    if state.config.send_enabled {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "Send feature is disabled. Start server without --disable-send to enable.".into(),
        ))
    }
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let inner = state.registry.lock().await;
    Json(json!({ "sessions": inner.list_wire(&state.multi) }))
}

async fn session_status(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let inner = state.registry.lock().await;
    let session = inner
        .get(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;
    Ok(Json(json!({
        "session_id": id,
        "running": session.process.is_some(),
        "queued_messages": session.queue.len(),
        "waiting_for_input": session.tailer.waiting_for_input(),
    })))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    require_send_enabled(&state)?;

    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("Message cannot be empty".into()));
    }

    match supervisor::send_message(&state, &id, message).await? {
        SendOutcome::Sent => Ok(Json(json!({ "status": "sent", "session_id": id }))),
        SendOutcome::Queued { position } => Ok(Json(json!({
            "status": "queued",
            "session_id": id,
            "queue_position": position,
        }))),
    }
}

async fn fork_session(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state.config.fork_enabled {
        return Err(ApiError::Forbidden(
            "Fork feature is disabled. Start server with --fork to enable.".into(),
        ));
    }

    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("Message cannot be empty".into()));
    }

    supervisor::fork_session(&state, &id, message).await?;
    Ok(Json(json!({ "status": "forking", "session_id": id })))
}

async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    require_send_enabled(&state)?;
    supervisor::interrupt_session(&state, &id).await?;
    Ok(Json(json!({ "status": "interrupted", "session_id": id })))
}

async fn trigger_summary(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    {
        let inner = state.registry.lock().await;
        if inner.get(&id).is_none() {
            return Err(ApiError::SessionNotFound(id));
        }
    }
    if !state.config.summaries_enabled() {
        return Err(ApiError::ServiceUnavailable(
            "Summarization is not configured. Start server with summarization options.".into(),
        ));
    }

    let model = state.config.idle_summary_model.clone();
    let state_task = state.clone();
    let session_id = id.clone();
    tokio::spawn(async move {
        if summarizer::summarize_session(&state_task, &session_id, Some(model)).await {
            tracing::info!("Manual summary completed for {session_id}");
        } else {
            tracing::warn!("Manual summary failed for {session_id}");
        }
    });

    Ok(Json(json!({ "status": "summarizing", "session_id": id })))
}

async fn create_new_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    require_send_enabled(&state)?;

    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("Message cannot be empty".into()));
    }

    let outcome = supervisor::new_session(
        &state,
        message,
        request.cwd.as_deref(),
        request.backend.as_deref(),
        request.model_index,
    )
    .await?;

    Ok(Json(match outcome {
        NewSessionOutcome::Started { cwd } => json!({ "status": "started", "cwd": cwd }),
        NewSessionOutcome::PermissionDenied {
            cwd,
            denials,
            original_message,
            backend,
            model_index,
        } => json!({
            "status": "permission_denied",
            "cwd": cwd,
            "denials": denials,
            "original_message": original_message,
            "backend": backend,
            "model_index": model_index,
        }),
    }))
}

async fn grant_permission(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
    Json(request): Json<GrantPermissionRequest>,
) -> Result<Json<Value>, ApiError> {
    require_send_enabled(&state)?;

    let original_message = request.original_message.trim().to_string();
    if original_message.is_empty() {
        return Err(ApiError::BadRequest(
            "Original message cannot be empty".into(),
        ));
    }

    let project_path = {
        let inner = state.registry.lock().await;
        let session = inner
            .get(&id)
            .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;
        let backend = state
            .multi
            .backend_for_session(&session.path)
            .ok_or_else(|| ApiError::Internal("no backend for session".into()))?;
        if !backend.supports_permission_detection() {
            return Err(ApiError::NotSupported(
                "This backend does not support permission management.".into(),
            ));
        }
        session.project_path.clone()
    };

    if !request.permissions.is_empty() {
        if project_path.is_empty() {
            return Err(ApiError::BadRequest(
                "Cannot grant permissions: session has no project path".into(),
            ));
        }
        let settings_path = project_settings_path(Path::new(&project_path));
        update_permissions_file(&settings_path, &request.permissions).map_err(|e| {
            ApiError::Internal(format!("Failed to write permissions file: {e}"))
        })?;
        tracing::info!(
            session_id = %id,
            "Granted permissions {:?} (wrote to {})",
            request.permissions,
            settings_path.display()
        );
    }

    // Retry the denied message with the new grants (and the current
    // allow-list flowing in as --add-dir).
    supervisor::send_message(&state, &id, &original_message).await?;

    Ok(Json(json!({
        "status": "granted",
        "session_id": id,
        "permissions": request.permissions,
    })))
}

async fn grant_permission_new(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GrantPermissionNewSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    require_send_enabled(&state)?;

    let original_message = request.original_message.trim().to_string();
    if original_message.is_empty() {
        return Err(ApiError::BadRequest(
            "Original message cannot be empty".into(),
        ));
    }

    let cwd = Path::new(&request.cwd);
    if !cwd.is_dir() {
        return Err(ApiError::BadRequest("Invalid working directory".into()));
    }

    // Sandbox-only denials arrive with no grant strings; the retry then
    // relies on the updated allow-list alone.
    if !request.permissions.is_empty() {
        let settings_path = project_settings_path(cwd);
        update_permissions_file(&settings_path, &request.permissions).map_err(|e| {
            ApiError::Internal(format!("Failed to write permissions file: {e}"))
        })?;
    }

    // The denied run already created a session for this cwd; send there
    // rather than creating a second one.
    let existing = {
        let inner = state.registry.lock().await;
        inner.find_by_project_path(cwd).map(|s| s.id.clone())
    };

    if let Some(session_id) = existing {
        tracing::info!(
            "Found session {session_id} for cwd {}, re-sending there",
            request.cwd
        );
        match supervisor::send_message(&state, &session_id, &original_message).await? {
            SendOutcome::Sent => {
                Ok(Json(json!({ "status": "sent", "session_id": session_id })))
            }
            SendOutcome::Queued { position } => Ok(Json(json!({
                "status": "queued",
                "session_id": session_id,
                "queue_position": position,
            }))),
        }
    } else {
        tracing::warn!("No session found for cwd {}, starting a new one", request.cwd);
        let outcome = supervisor::new_session(
            &state,
            &original_message,
            Some(request.cwd.as_str()),
            request.backend.as_deref(),
            request.model_index,
        )
        .await?;
        Ok(Json(match outcome {
            NewSessionOutcome::Started { cwd } => json!({ "status": "started", "cwd": cwd }),
            NewSessionOutcome::PermissionDenied {
                cwd,
                denials,
                original_message,
                backend,
                model_index,
            } => json!({
                "status": "permission_denied",
                "cwd": cwd,
                "denials": denials,
                "original_message": original_message,
                "backend": backend,
                "model_index": model_index,
            }),
        }))
    }
}

async fn allow_directory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AllowDirectoryRequest>,
) -> Result<Json<Value>, ApiError> {
    require_send_enabled(&state)?;

    if request.directory.is_empty() {
        return Err(ApiError::BadRequest("Directory cannot be empty".into()));
    }

    let directory = normalize_directory(&request.directory);
    state.allowed_dirs.add(&directory);
    tracing::info!("Added allowed directory: {directory}");

    for extra in request.add_dirs.unwrap_or_default() {
        let normalized = normalize_directory(&extra);
        state.allowed_dirs.add(&normalized);
        tracing::info!("Added additional allowed directory: {normalized}");
    }

    Ok(Json(json!({ "status": "allowed", "directory": directory })))
}

/// Expand `~` and canonicalize where possible.
fn normalize_directory(raw: &str) -> String {
    let expanded = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| "/".into())
    } else if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir().unwrap_or_else(|| "/".into()).join(rest)
    } else {
        raw.into()
    };
    expanded
        .canonicalize()
        .unwrap_or(expanded)
        .to_string_lossy()
        .to_string()
}
