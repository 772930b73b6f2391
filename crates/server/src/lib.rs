// crates/server/src/lib.rs
//! Tailboard server: session registry, file watcher, event hub, process
//! supervisor, permission interceptor, summarizer, and the axum façade.

pub mod config;
pub mod error;
pub mod hub;
pub mod permissions;
pub mod registry;
pub mod routes;
pub mod state;
pub mod summarizer;
pub mod supervisor;
pub mod thinking;
pub mod watcher;

pub use config::Config;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the full application router.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::events::router())
        .merge(routes::sessions::router())
        .merge(routes::backends::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
