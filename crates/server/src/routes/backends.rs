// crates/server/src/routes/backends.rs
//! Backend enumeration, model lists, feature flags, and liveness.

use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    response::Html,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use tailboard_core::{normalize_backend_name, Backend};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/send-enabled", get(send_enabled))
        .route("/fork-enabled", get(fork_enabled))
        .route("/default-send-backend", get(default_send_backend))
        .route("/backends", get(list_backends))
        .route("/backends/{name}/models", get(list_backend_models))
}

/// Minimal page; the real UI is served by the frontend collaborator.
async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Tailboard</title></head>\
         <body><h1>Tailboard</h1>\
         <p>Session events at <code>/events</code>, REST at <code>/sessions</code>.</p>\
         </body></html>",
    )
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions = state.registry.lock().await.count();
    Json(json!({
        "status": "ok",
        "sessions": sessions,
        "clients": state.hub.client_count(),
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

async fn send_enabled(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "enabled": state.config.send_enabled }))
}

async fn fork_enabled(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "enabled": state.config.fork_enabled }))
}

async fn default_send_backend(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "backend": state.config.default_send_backend }))
}

async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Value> {
    let backends: Vec<Value> = state
        .multi
        .backends()
        .iter()
        .map(|b| {
            json!({
                "name": b.name(),
                "cli_available": b.is_cli_available(),
                "supports_models": !b.models().is_empty(),
            })
        })
        .collect();
    Json(json!({ "backends": backends }))
}

/// Model list for one backend. The returned indexes are the namespace for
/// `model_index` in new-session requests, so the list is cached.
async fn list_backend_models(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let backend = state
        .multi
        .backend_by_name(&name)
        .ok_or(ApiError::BackendNotFound(name))?;

    let models = backend.models();
    state
        .cached_models
        .lock()
        .unwrap()
        .insert(normalize_backend_name(backend.name()), models.clone());

    Ok(Json(json!({ "models": models })))
}
