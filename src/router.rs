//! Result router: consumes results destined for a client and forwards them
//! correctly, tracking the bookkeeping that unblocks the next job publish.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::dispatcher::{DispatchOutcome, JobDispatcher};
use crate::envelopes::ResultEnvelope;
use crate::flow::ClientRegistry;
use crate::protocol::ServerMessage;
use crate::session::{ClientId, SessionStore};

/// What the router did with one result message, useful for tests and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded { unlocked: bool, utterance_ended: bool },
    SuppressedIntermediate,
    DroppedOutOfOrder,
}

pub struct ResultRouter<S: SessionStore> {
    store: Arc<S>,
    registry: ClientRegistry,
    dispatcher: Arc<JobDispatcher>,
}

impl<S: SessionStore> ResultRouter<S> {
    pub fn new(store: Arc<S>, registry: ClientRegistry, dispatcher: Arc<JobDispatcher>) -> Self {
        Self { store, registry, dispatcher }
    }

    /// Process one raw result message for `client_id`. Returns `None` if
    /// the payload could not be parsed (logged, not propagated — a single
    /// malformed result must not take down the forwarding task).
    pub async fn route(&self, client_id: &ClientId, raw: &[u8]) -> Option<RouteOutcome> {
        let result = match ResultEnvelope::parse(raw) {
            Ok(result) => result,
            Err(e) => {
                warn!(client_id, error = %e, "dropping malformed result message");
                return None;
            }
        };

        if &result.client_id != client_id {
            warn!(client_id, mismatched = %result.client_id, "result client_id mismatch, dropping");
            return None;
        }

        let session = match self.store.load(client_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(client_id, error = %e, "could not load session while routing result");
                return None;
            }
        };
        let translation_enabled = session.translation_enabled();

        let segment_id = result.segment_id_numeric();
        let latest_sent = self.registry.latest_segment_id_sent(client_id).await;
        let is_translation_result = result.is_translation_result();

        let should_forward = if segment_id <= latest_sent {
            false
        } else if translation_enabled {
            is_translation_result
        } else {
            true
        };

        if segment_id <= latest_sent {
            debug!(client_id, segment_id, latest_sent, "dropping out-of-order result");
        }

        if should_forward {
            self.registry.set_latest_segment_id_sent(client_id, segment_id).await;
            let message = ServerMessage::Realtime {
                text: result.text.clone(),
                translation: result.translation.clone(),
                segment_id: result.segment_id.clone(),
                processing_time: result.processing_time,
            };
            if !self.registry.send_to_client(client_id, message.to_bytes()).await {
                warn!(client_id, "transport failure forwarding result, cleaning up client");
                self.cleanup_client(client_id).await;
                return Some(RouteOutcome::DroppedOutOfOrder);
            }
        }

        let unlocks_in_flight = if translation_enabled {
            is_translation_result
        } else {
            true
        };

        let mut unlocked = false;
        if unlocks_in_flight {
            self.registry.set_in_flight(client_id, false).await;
            unlocked = true;
        }

        // Gated on `should_forward`, not just the unlock predicate, so a
        // belated result for a segment the client has already moved past
        // (e.g. one still in flight when `start_over` reset the watermark)
        // cannot surface a phantom utterance_end for an utterance nothing
        // was ever forwarded for.
        let mut utterance_ended = false;
        if result.is_final && should_forward {
            let message = ServerMessage::UtteranceEnd {
                client_id: client_id.clone(),
            };
            let _ = self.registry.send_to_client(client_id, message.to_bytes()).await;
            utterance_ended = true;
        }

        if unlocked && session.audio_buffer.len() > session.last_published_len {
            self.catch_up_publish(client_id, &session).await;
        }

        if !should_forward && segment_id > latest_sent {
            return Some(RouteOutcome::SuppressedIntermediate);
        }
        if segment_id <= latest_sent {
            return Some(RouteOutcome::DroppedOutOfOrder);
        }
        Some(RouteOutcome::Forwarded { unlocked, utterance_ended })
    }

    /// Invokes the job dispatcher directly and persists only the changed
    /// `last_published_len` marker, never the whole session blob, on this
    /// hot path.
    async fn catch_up_publish(&self, client_id: &ClientId, session: &crate::session::SpeechSession) {
        debug!(client_id, "in_flight cleared with pending data, scheduling catch-up publish");
        let mut session = session.clone();
        match self.dispatcher.maybe_publish(client_id, &mut session, false).await {
            Ok(DispatchOutcome::Published { .. }) => {
                self.registry.set_in_flight(client_id, true).await;
                if let Err(e) = self.store.save_published_len(client_id, session.last_published_len).await {
                    warn!(client_id, error = %e, "failed to persist catch-up publish marker");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(client_id, error = %e, "catch-up publish failed"),
        }
    }

    async fn cleanup_client(&self, client_id: &ClientId) {
        let _ = self.store.delete(client_id).await;
        self.registry.remove(client_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryJobStream;
    use crate::config::Config;
    use crate::session::store::InMemorySessionStore;
    use crate::session::SpeechSession;
    use tokio::sync::mpsc;

    async fn router_with_session(
        client_id: &str,
        session: SpeechSession,
    ) -> (ResultRouter<InMemorySessionStore>, ClientRegistry, mpsc::Receiver<Vec<u8>>) {
        let store = Arc::new(InMemorySessionStore::new("en", "en"));
        store.save(&client_id.to_string(), &session).await.unwrap();
        let registry = ClientRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        registry.register(client_id.to_string(), tx).await;
        let dispatcher = Arc::new(JobDispatcher::new(Arc::new(InMemoryJobStream::new()), Arc::new(Config::default())));
        (ResultRouter::new(store, registry.clone(), dispatcher), registry, rx)
    }

    fn result(client_id: &str, segment_id: &str, translation: &str, is_final: bool) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "status": "ok",
            "job_id": "j1",
            "client_id": client_id,
            "segment_id": segment_id,
            "text": "hello",
            "translation": translation,
            "source_lang": "en",
            "target_lang": if translation.is_empty() { "en" } else { "vi" },
            "translation_enabled": !translation.is_empty(),
            "is_final": if is_final { "true" } else { "false" },
            "processing_time": 0.1,
            "audio_duration": 1.0,
            "worker_id": "w1",
            "timestamp": 1_700_000_000.0,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn stt_only_result_forwards_and_unlocks_when_translation_disabled() {
        let session = SpeechSession::fresh("en", "en");
        let (router, registry, mut rx) = router_with_session("c1", session).await;
        registry.set_in_flight("c1", true).await;

        let outcome = router.route(&"c1".to_string(), &result("c1", "10", "", false)).await;

        assert_eq!(outcome, Some(RouteOutcome::Forwarded { unlocked: true, utterance_ended: false }));
        assert!(!registry.is_in_flight("c1").await);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stt_only_result_is_suppressed_when_translation_enabled() {
        let session = SpeechSession::fresh("en", "vi");
        let (router, registry, mut rx) = router_with_session("c1", session).await;
        registry.set_in_flight("c1", true).await;

        let outcome = router.route(&"c1".to_string(), &result("c1", "10", "", false)).await;

        assert_eq!(outcome, Some(RouteOutcome::SuppressedIntermediate));
        // STT result must not unlock in_flight when translation is pending.
        assert!(registry.is_in_flight("c1").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn translation_result_forwards_and_unlocks_when_translation_enabled() {
        let session = SpeechSession::fresh("en", "vi");
        let (router, registry, mut rx) = router_with_session("c1", session).await;
        registry.set_in_flight("c1", true).await;

        let outcome = router.route(&"c1".to_string(), &result("c1", "10", "xin chao", true)).await;

        assert_eq!(outcome, Some(RouteOutcome::Forwarded { unlocked: true, utterance_ended: true }));
        assert!(!registry.is_in_flight("c1").await);
        // realtime + utterance_end
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn out_of_order_result_is_dropped() {
        let session = SpeechSession::fresh("en", "en");
        let (router, registry, mut rx) = router_with_session("c1", session).await;
        registry.set_latest_segment_id_sent("c1", 50).await;

        let outcome = router.route(&"c1".to_string(), &result("c1", "10", "", false)).await;

        assert_eq!(outcome, Some(RouteOutcome::DroppedOutOfOrder));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn catch_up_publish_marks_the_new_job_in_flight() {
        let mut session = SpeechSession::fresh("en", "en");
        session.state = crate::session::SpeechState::Active;
        // 1.5s of unpublished audio — enough to clear the minimum-new-speech
        // gate so the catch-up publish actually fires.
        session.audio_buffer = vec![0; 48_000];
        session.last_published_len = 0;
        let (router, registry, mut rx) = router_with_session("c1", session).await;
        registry.set_in_flight("c1", true).await;

        let outcome = router.route(&"c1".to_string(), &result("c1", "10", "", false)).await;

        assert_eq!(outcome, Some(RouteOutcome::Forwarded { unlocked: true, utterance_ended: false }));
        // The unlock from the routed result immediately triggers a catch-up
        // publish for the pending audio; in_flight must end up true again,
        // not false, or the next chunk's ingest loop can race a second
        // concurrent publish for the same client.
        assert!(registry.is_in_flight("c1").await);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn malformed_result_is_dropped_without_panicking() {
        let session = SpeechSession::fresh("en", "en");
        let (router, _registry, _rx) = router_with_session("c1", session).await;
        let outcome = router.route(&"c1".to_string(), b"not json").await;
        assert_eq!(outcome, None);
    }
}
