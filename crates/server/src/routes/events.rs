// crates/server/src/routes/events.rs
//! The push channel: `GET /events` (SSE).
//!
//! On connect a client receives the sorted session list and a
//! `catchup_complete` sentinel, then live events from its bounded queue.
//! An idle channel gets a `ping` every 30 seconds. A catchup that blows
//! its wall-clock budget turns into `reinitialize` and a close; the
//! client drops local state and reconnects.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
    Router,
};

use crate::hub::OutboundEvent;
use crate::state::AppState;

/// Budget for the initial catchup burst.
const CATCHUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle keep-alive interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/events", get(events))
}

/// Unregisters the client when the stream is dropped (disconnect or
/// reinitialize), whichever exit path runs.
struct ClientGuard {
    state: Arc<AppState>,
    client_id: u64,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.state.hub.unregister(self.client_id);
    }
}

fn sse_event(event: &OutboundEvent) -> Event {
    Event::default().event(event.name).data(event.data.to_string())
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (client_id, mut rx) = state.hub.register();

    let stream = async_stream::stream! {
        let _guard = ClientGuard { state: state.clone(), client_id };
        let catchup_started = Instant::now();

        // Catchup: the session list under the registry lock, then the
        // sentinel. Messages are loaded on demand over REST.
        let sessions = {
            let inner = state.registry.lock().await;
            inner.list_wire(&state.multi)
        };

        if catchup_started.elapsed() > CATCHUP_TIMEOUT {
            tracing::warn!(client_id, "Catchup exceeded budget, telling client to reinitialize");
            yield Ok(sse_event(&OutboundEvent::reinitialize()));
            return;
        }

        yield Ok(sse_event(&OutboundEvent::sessions(sessions)));
        yield Ok(sse_event(&OutboundEvent::catchup_complete()));

        loop {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some(event) => yield Ok(sse_event(&event)),
                        // Hub dropped us (queue overflow): close so the
                        // client reconnects fresh.
                        None => break,
                    }
                }
                _ = tokio::time::sleep(PING_INTERVAL) => {
                    yield Ok(sse_event(&OutboundEvent::ping()));
                }
            }
        }
    };

    Sse::new(stream)
}
