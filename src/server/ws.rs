//! Per-connection WebSocket handler: the audio-ingest loop and the
//! result-forwarding loop for one connected client.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::DispatchOutcome;
use crate::engine::{ChunkEvent, SpeechSessionEngine};
use crate::protocol::{AudioFrame, ClientControlMessage, ServerMessage};
use crate::server::ServerState;
use crate::session::{SessionStore, SpeechSession};

/// Ingest read timeout: short enough that the ingest loop regularly comes
/// up for air to notice per-client flow changes, long enough not to busy-spin.
const INGEST_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub async fn websocket_handler<S: SessionStore + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<ServerState<S>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<S: SessionStore + 'static>(socket: WebSocket, state: ServerState<S>) {
    let client_id = Uuid::new_v4().to_string();
    info!(client_id = %client_id, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let writer_client_id = client_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                debug!(client_id = %writer_client_id, "write failed, closing connection");
                break;
            }
        }
    });

    state.registry.register(client_id.clone(), tx.clone()).await;

    let mut session = match state.store.load(&client_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "failed to load session at connect");
            writer_task.abort();
            state.registry.remove(&client_id).await;
            return;
        }
    };

    let status = status_message(&client_id, &session);
    let _ = tx.send(status.to_bytes()).await;

    let result_rx = match state.result_bus.subscribe(&client_id).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "failed to subscribe to result channel");
            writer_task.abort();
            state.registry.remove(&client_id).await;
            return;
        }
    };

    let forwarding_router = state.router.clone();
    let forwarding_client_id = client_id.clone();
    let mut forwarding_task = tokio::spawn(async move {
        let mut result_rx = result_rx;
        while let Some(payload) = result_rx.recv().await {
            forwarding_router.route(&forwarding_client_id, &payload).await;
        }
    });

    tokio::select! {
        _ = ingest_loop(&client_id, &mut ws_receiver, &mut session, &state) => {}
        _ = &mut forwarding_task => {}
    }

    forwarding_task.abort();
    writer_task.abort();
    state.result_bus.unsubscribe(&client_id).await;
    state.registry.remove(&client_id).await;
    if let Err(e) = state.store.delete(&client_id).await {
        warn!(client_id = %client_id, error = %e, "failed to delete session on disconnect");
    }
    info!(client_id = %client_id, "client disconnected, state released");
}

async fn ingest_loop<S: SessionStore + 'static>(
    client_id: &str,
    ws_receiver: &mut (impl futures::Stream<Item = Result<Message, axum::Error>> + Unpin),
    session: &mut SpeechSession,
    state: &ServerState<S>,
) {
    loop {
        let next = tokio::time::timeout(INGEST_READ_TIMEOUT, ws_receiver.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                warn!(client_id, error = %e, "transport error, closing connection");
                return;
            }
            Ok(None) => return,
            Err(_) => continue,
        };

        match message {
            Message::Binary(bytes) => handle_audio_frame(client_id, &bytes, session, state).await,
            Message::Text(text) => handle_control_message(client_id, &text, session, state).await,
            Message::Close(_) => {
                debug!(client_id, "client sent close frame");
                return;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn handle_audio_frame<S: SessionStore + 'static>(
    client_id: &str,
    bytes: &[u8],
    session: &mut SpeechSession,
    state: &ServerState<S>,
) {
    let frame = match AudioFrame::parse(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(client_id, error = %e, "dropping malformed audio frame");
            return;
        }
    };

    let has_speech = match state.vad.detect_speech_activity(&frame.pcm) {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(client_id, error = %e, "VAD failed on chunk, skipping without mutating session state");
            return;
        }
    };

    let now = now_seconds();
    let event = SpeechSessionEngine::process_chunk(session, &frame.pcm, has_speech, now, &state.config);

    match event {
        ChunkEvent::Continue => {
            let in_flight = state.registry.is_in_flight(client_id).await;
            try_publish(client_id, session, state, in_flight, false).await;
        }
        ChunkEvent::SilenceTimeout => {
            try_publish(client_id, session, state, false, true).await;
            session.end_speech_session();
        }
        ChunkEvent::BufferOverflow => {
            if state.config.send_final_job_on_max_buffer {
                try_publish(client_id, session, state, false, true).await;
            }
            session.end_speech_session();
        }
    }

    if let Err(e) = state.store.save(&client_id.to_string(), session).await {
        warn!(client_id, error = %e, "failed to persist session after chunk");
    }
}

async fn try_publish<S: SessionStore + 'static>(
    client_id: &str,
    session: &mut SpeechSession,
    state: &ServerState<S>,
    in_flight: bool,
    force_final: bool,
) {
    let outcome = if force_final {
        state.dispatcher.force_final_publish(client_id, session).await
    } else {
        state.dispatcher.maybe_publish(client_id, session, in_flight).await
    };

    match outcome {
        Ok(DispatchOutcome::Published { .. }) => {
            state.registry.set_in_flight(client_id, true).await;
        }
        Ok(_) => {}
        Err(e) => warn!(client_id, error = %e, "job publish failed"),
    }
}

async fn handle_control_message<S: SessionStore + 'static>(
    client_id: &str,
    text: &str,
    session: &mut SpeechSession,
    state: &ServerState<S>,
) {
    let message = match ClientControlMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(client_id, error = %e, "ignoring malformed control message");
            return;
        }
    };

    match message {
        ClientControlMessage::SetLangs { source_language, target_language } => {
            session.source_lang = source_language;
            session.target_lang = target_language;
            if let Err(e) = state.store.save(&client_id.to_string(), session).await {
                warn!(client_id, error = %e, "failed to persist language change");
            }
            state.registry.send_to_client(client_id, status_message(client_id, session).to_bytes()).await;
        }
        ClientControlMessage::GetStatus => {
            state.registry.send_to_client(client_id, status_message(client_id, session).to_bytes()).await;
        }
        ClientControlMessage::StartOver => {
            session.end_speech_session();
            if let Err(e) = state.store.save(&client_id.to_string(), session).await {
                warn!(client_id, error = %e, "failed to persist start_over reset");
            }
            // Any result for the job that was in flight before this reset must
            // not surface a belated realtime/utterance_end frame: bump the
            // watermark to "now" so it reads as stale under segment_id gating.
            state.registry.set_in_flight(client_id, false).await;
            state.registry.set_latest_segment_id_sent(client_id, now_millis()).await;
        }
    }
}

fn status_message(client_id: &str, session: &SpeechSession) -> ServerMessage {
    ServerMessage::Status {
        client_id: client_id.to_string(),
        source_language: session.source_lang.clone(),
        target_language: session.target_lang.clone(),
        translation_enabled: session.translation_enabled(),
    }
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
