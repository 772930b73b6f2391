// crates/server/src/hub.rs
//! Event hub: bounded per-client queues with non-blocking publish.
//!
//! One slow client must never slow the others. Every publish is a
//! `try_send`; a full (or closed) queue marks that client dead and it is
//! dropped on the spot; it will reconnect and re-catchup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use tailboard_core::{NormalizedMessage, TokenUsage};

/// Events a client queue can hold before the client is considered dead.
pub const CLIENT_QUEUE_CAPACITY: usize = 100;

/// One named SSE event with a JSON payload.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub name: &'static str,
    pub data: Value,
}

impl OutboundEvent {
    pub fn sessions(sessions: Vec<Value>) -> Self {
        Self {
            name: "sessions",
            data: json!({ "sessions": sessions }),
        }
    }

    pub fn catchup_complete() -> Self {
        Self {
            name: "catchup_complete",
            data: json!({}),
        }
    }

    pub fn ping() -> Self {
        Self {
            name: "ping",
            data: json!({}),
        }
    }

    /// Instructs a lagging client to drop local state and reconnect.
    pub fn reinitialize() -> Self {
        Self {
            name: "reinitialize",
            data: json!({}),
        }
    }

    pub fn message(session_id: &str, message: &NormalizedMessage) -> Self {
        Self {
            name: "message",
            data: json!({
                "session_id": session_id,
                "message": message,
            }),
        }
    }

    pub fn session_added(session: Value) -> Self {
        Self {
            name: "session_added",
            data: session,
        }
    }

    pub fn session_removed(session_id: &str) -> Self {
        Self {
            name: "session_removed",
            data: json!({ "id": session_id }),
        }
    }

    pub fn session_status(
        session_id: &str,
        running: bool,
        queued_messages: usize,
        waiting_for_input: bool,
    ) -> Self {
        Self {
            name: "session_status",
            data: json!({
                "session_id": session_id,
                "running": running,
                "queued_messages": queued_messages,
                "waiting_for_input": waiting_for_input,
            }),
        }
    }

    pub fn session_summary_updated(
        session_id: &str,
        title: Option<&str>,
        short: Option<&str>,
        executive: Option<&str>,
    ) -> Self {
        Self {
            name: "session_summary_updated",
            data: json!({
                "session_id": session_id,
                "summaryTitle": title,
                "summaryShort": short,
                "summaryExecutive": executive,
            }),
        }
    }

    pub fn session_token_usage_updated(session_id: &str, usage: &TokenUsage) -> Self {
        Self {
            name: "session_token_usage_updated",
            data: json!({
                "session_id": session_id,
                "tokenUsage": usage,
            }),
        }
    }

    pub fn permission_denied(session_id: &str, denials: &Value, original_message: &str) -> Self {
        Self {
            name: "permission_denied",
            data: json!({
                "session_id": session_id,
                "denials": denials,
                "original_message": original_message,
            }),
        }
    }
}

struct Client {
    id: u64,
    tx: mpsc::Sender<OutboundEvent>,
}

/// Registry of connected push-channel clients.
#[derive(Default)]
pub struct EventHub {
    clients: Mutex<Vec<Client>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client and hand back its queue.
    pub fn register(&self) -> (u64, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().unwrap().push(Client { id, tx });
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Publish to every client. Never blocks; dead clients are removed.
    pub fn broadcast(&self, event: OutboundEvent) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|client| match client.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(client_id = client.id, "Dropping dead SSE client");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_registered_clients() {
        let hub = EventHub::new();
        let (_a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();

        hub.broadcast(OutboundEvent::session_removed("s1"));

        assert_eq!(rx_a.recv().await.unwrap().name, "session_removed");
        assert_eq!(rx_b.recv().await.unwrap().name, "session_removed");
    }

    #[tokio::test]
    async fn full_queue_drops_the_client() {
        let hub = EventHub::new();
        let (_id, rx) = hub.register();
        // Client never reads.
        for _ in 0..=CLIENT_QUEUE_CAPACITY {
            hub.broadcast(OutboundEvent::ping());
        }
        assert_eq!(hub.client_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_next_publish() {
        let hub = EventHub::new();
        let (_id, rx) = hub.register();
        drop(rx);
        hub.broadcast(OutboundEvent::ping());
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn per_client_order_is_publish_order() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.register();

        hub.broadcast(OutboundEvent::session_removed("a"));
        hub.broadcast(OutboundEvent::session_removed("b"));

        assert_eq!(rx.recv().await.unwrap().data["id"], "a");
        assert_eq!(rx.recv().await.unwrap().data["id"], "b");
    }

    #[test]
    fn status_event_payload_shape() {
        let ev = OutboundEvent::session_status("s1", true, 2, false);
        assert_eq!(ev.data["running"], true);
        assert_eq!(ev.data["queued_messages"], 2);
        assert_eq!(ev.data["waiting_for_input"], false);
    }
}
