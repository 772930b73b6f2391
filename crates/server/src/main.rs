// crates/server/src/main.rs
//! Tailboard server binary.
//!
//! Builds the backends, seeds the registry with recent sessions, starts
//! the file watcher, and serves the SSE/REST surface on loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::FmtSubscriber;

use tailboard_core::{claude_code::ClaudeCodeBackend, opencode::OpenCodeBackend, MultiBackend};
use tailboard_server::{
    config::Cli, create_app, permissions::AllowedDirectories, watcher, AppState, Config,
};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from(Cli::parse());

    let multi = Arc::new(MultiBackend::new(
        vec![
            Arc::new(ClaudeCodeBackend::new(None)),
            Arc::new(OpenCodeBackend::new(None)),
        ],
        config.default_send_backend.clone(),
    ));

    let port = config.port;
    let state = AppState::new(config, multi, AllowedDirectories::default_path());

    // Seed the registry with recent sessions. No eviction at startup: the
    // scan is already capped at max_sessions.
    {
        let recent = state
            .multi
            .find_recent(state.config.max_sessions, state.config.include_subagents);
        let mut inner = state.registry.lock().await;
        for path in recent {
            inner.add(&state.multi, &path, false);
        }
        if inner.count() == 0 {
            tracing::warn!("No session files found");
        } else {
            tracing::info!("Tracking {} sessions", inner.count());
        }
    }

    let shutdown = CancellationToken::new();
    let watcher_task = watcher::spawn_watcher(state.clone(), shutdown.clone());

    let app = create_app(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{addr}");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = watcher_task.await;
    Ok(())
}
