//! In-memory, per-client flow state: the bookkeeping that lives only in
//! gateway memory (never persisted) and coordinates the ingest task and
//! the result-forwarding task for a single connected client.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Outbound messages queued for a client's WebSocket sender half.
pub type ClientSender = mpsc::Sender<Vec<u8>>;

/// Per-client flow bookkeeping. `websocket` is the outbound channel to the
/// connection's writer task rather than the socket itself, so sending never
/// blocks the caller on network I/O.
pub struct PerClientFlowState {
    pub in_flight: bool,
    pub latest_segment_id_sent: i64,
    pub websocket: ClientSender,
}

impl PerClientFlowState {
    pub fn new(websocket: ClientSender) -> Self {
        Self {
            in_flight: false,
            latest_segment_id_sent: i64::MIN,
            websocket,
        }
    }
}

/// All connected clients' flow state behind a single lock. A single lock
/// (rather than three separate maps for `connected_clients`, `in_flight`,
/// and `latest_segment_id_sent`) keeps the at-most-one-in-flight critical
/// section trivially atomic: reading and writing `in_flight` for a client
/// never straddles a suspension point because both happen under one guard.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<Mutex<HashMap<String, PerClientFlowState>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client_id: String, sender: ClientSender) {
        self.inner.lock().await.insert(client_id, PerClientFlowState::new(sender));
    }

    pub async fn remove(&self, client_id: &str) -> Option<PerClientFlowState> {
        self.inner.lock().await.remove(client_id)
    }

    pub async fn is_in_flight(&self, client_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(client_id)
            .map(|s| s.in_flight)
            .unwrap_or(false)
    }

    pub async fn set_in_flight(&self, client_id: &str, value: bool) {
        if let Some(state) = self.inner.lock().await.get_mut(client_id) {
            state.in_flight = value;
        }
    }

    pub async fn latest_segment_id_sent(&self, client_id: &str) -> i64 {
        self.inner
            .lock()
            .await
            .get(client_id)
            .map(|s| s.latest_segment_id_sent)
            .unwrap_or(i64::MIN)
    }

    pub async fn set_latest_segment_id_sent(&self, client_id: &str, segment_id: i64) {
        if let Some(state) = self.inner.lock().await.get_mut(client_id) {
            state.latest_segment_id_sent = segment_id;
        }
    }

    pub async fn send_to_client(&self, client_id: &str, message: Vec<u8>) -> bool {
        let sender = {
            let guard = self.inner.lock().await;
            guard.get(client_id).map(|s| s.websocket.clone())
        };
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_flight_flag_round_trips_per_client() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("c1".to_string(), tx).await;

        assert!(!registry.is_in_flight("c1").await);
        registry.set_in_flight("c1", true).await;
        assert!(registry.is_in_flight("c1").await);
    }

    #[tokio::test]
    async fn latest_segment_id_defaults_to_minimum() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("c1".to_string(), tx).await;

        assert_eq!(registry.latest_segment_id_sent("c1").await, i64::MIN);
        registry.set_latest_segment_id_sent("c1", 42).await;
        assert_eq!(registry.latest_segment_id_sent("c1").await, 42);
    }

    #[tokio::test]
    async fn removed_client_has_no_flow_state() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("c1".to_string(), tx).await;
        assert!(registry.remove("c1").await.is_some());
        assert!(!registry.is_in_flight("c1").await);
    }

    #[tokio::test]
    async fn send_to_client_forwards_bytes_through_the_channel() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register("c1".to_string(), tx).await;

        assert!(registry.send_to_client("c1", b"hi".to_vec()).await);
        assert_eq!(rx.recv().await.unwrap(), b"hi".to_vec());
    }
}
