//! Session store — persists `SpeechSession` keyed by client id so any
//! gateway instance can serve any client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::session::{ClientId, SpeechSession, SpeechState};

/// Implementors must refresh TTL on every save and must not silently fall
/// back to memory-only storage on failure — the caller surfaces
/// `StoreError` and retries its enclosing operation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, client_id: &ClientId) -> Result<SpeechSession, StoreError>;
    async fn save(&self, client_id: &ClientId, session: &SpeechSession) -> Result<(), StoreError>;
    async fn delete(&self, client_id: &ClientId) -> Result<(), StoreError>;

    /// Persist only the changed `last_published_len` marker. The default
    /// implementation round-trips the whole session; implementations
    /// backed by a field-addressable store should override this to touch
    /// only that one field on the catch-up-publish hot path.
    async fn save_published_len(&self, client_id: &ClientId, last_published_len: usize) -> Result<(), StoreError> {
        let mut session = self.load(client_id).await?;
        session.last_published_len = last_published_len;
        self.save(client_id, &session).await
    }
}

/// Redis-backed implementation. Scalar fields and binary buffers are stored
/// under separate keys so a textual hash encoding never has to carry raw PCM
/// bytes.
pub struct RedisSessionStore {
    conn: ConnectionManager,
    session_prefix: String,
    default_source_lang: String,
    default_target_lang: String,
    ttl_seconds: u64,
    cache: Mutex<HashMap<ClientId, (SpeechSession, Instant)>>,
    cache_ttl: std::time::Duration,
}

impl RedisSessionStore {
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.redis_url.clone())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            session_prefix: config.session_prefix.clone(),
            default_source_lang: config.default_source_language.clone(),
            default_target_lang: config.default_target_language.clone(),
            ttl_seconds: config.session_expiration_seconds,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: config.session_cache_ttl(),
        })
    }

    fn scalar_key(&self, client_id: &str) -> String {
        format!("{}{}", self.session_prefix, client_id)
    }

    fn audio_key(&self, client_id: &str) -> String {
        format!("{}{}:audio_buffer", self.session_prefix, client_id)
    }

    fn pre_speech_key(&self, client_id: &str) -> String {
        format!("{}{}:pre_speech_buffer", self.session_prefix, client_id)
    }

    async fn invalidate_cache(&self, client_id: &ClientId) {
        self.cache.lock().await.remove(client_id);
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self, client_id: &ClientId) -> Result<SpeechSession, StoreError> {
        {
            let cache = self.cache.lock().await;
            if let Some((session, cached_at)) = cache.get(client_id) {
                if cached_at.elapsed() < self.cache_ttl {
                    return Ok(session.clone());
                }
            }
        }

        let mut conn = self.conn.clone();
        let scalar_key = self.scalar_key(client_id);
        let fields: HashMap<String, String> = conn
            .hgetall(&scalar_key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let session = if fields.is_empty() {
            SpeechSession::fresh(&self.default_source_lang, &self.default_target_lang)
        } else {
            let audio_buffer: Vec<u8> = conn
                .get(self.audio_key(client_id))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let pre_speech_buffer: Vec<u8> = conn
                .get(self.pre_speech_key(client_id))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            decode_session(client_id, &fields, audio_buffer, pre_speech_buffer)?
        };

        self.cache
            .lock()
            .await
            .insert(client_id.clone(), (session.clone(), Instant::now()));
        Ok(session)
    }

    async fn save(&self, client_id: &ClientId, session: &SpeechSession) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let scalar_key = self.scalar_key(client_id);
        let audio_key = self.audio_key(client_id);
        let pre_speech_key = self.pre_speech_key(client_id);

        let fields = encode_session(session);
        conn.hset_multiple::<_, _, _, ()>(&scalar_key, &fields)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if session.audio_buffer.is_empty() {
            let _: () = conn
                .del(&audio_key)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        } else {
            let _: () = conn
                .set(&audio_key, &session.audio_buffer)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        if session.pre_speech_buffer.is_empty() {
            let _: () = conn
                .del(&pre_speech_key)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        } else {
            let _: () = conn
                .set(&pre_speech_key, &session.pre_speech_buffer)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let _: () = conn
            .expire(&scalar_key, self.ttl_seconds as i64)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .expire(&audio_key, self.ttl_seconds as i64)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: () = conn
            .expire(&pre_speech_key, self.ttl_seconds as i64)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        self.cache
            .lock()
            .await
            .insert(client_id.clone(), (session.clone(), Instant::now()));
        debug!(client_id, bytes = session.audio_buffer.len(), "session saved");
        Ok(())
    }

    async fn delete(&self, client_id: &ClientId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let keys = [
            self.scalar_key(client_id),
            self.audio_key(client_id),
            self.pre_speech_key(client_id),
        ];
        let _: () = conn
            .del(&keys[..])
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.invalidate_cache(client_id).await;
        Ok(())
    }

    async fn save_published_len(&self, client_id: &ClientId, last_published_len: usize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.scalar_key(client_id);
        let _: () = conn
            .hset(&key, "last_published_len", last_published_len.to_string())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.invalidate_cache(client_id).await;
        Ok(())
    }
}

fn encode_session(session: &SpeechSession) -> Vec<(String, String)> {
    vec![
        ("state".to_string(), session.state.as_str().to_string()),
        (
            "silence_start_time".to_string(),
            session.silence_start_time.map(|t| t.to_string()).unwrap_or_default(),
        ),
        (
            "session_start_time".to_string(),
            session.session_start_time.map(|t| t.to_string()).unwrap_or_default(),
        ),
        (
            "last_published_len".to_string(),
            session.last_published_len.to_string(),
        ),
        (
            "silence_buffer_start_len".to_string(),
            session.silence_buffer_start_len.to_string(),
        ),
        ("source_lang".to_string(), session.source_lang.clone()),
        ("target_lang".to_string(), session.target_lang.clone()),
        (
            "accumulated_audio_bytes".to_string(),
            session.accumulated_audio_bytes.to_string(),
        ),
        (
            "last_stt_send_time".to_string(),
            session.last_stt_send_time.map(|t| t.to_string()).unwrap_or_default(),
        ),
    ]
}

fn decode_session(
    client_id: &str,
    fields: &HashMap<String, String>,
    audio_buffer: Vec<u8>,
    pre_speech_buffer: Vec<u8>,
) -> Result<SpeechSession, StoreError> {
    let get = |k: &str| fields.get(k).map(|s| s.as_str()).unwrap_or("");

    let last_published_len = parse_usize(client_id, "last_published_len", get("last_published_len"))?;
    let silence_buffer_start_len =
        parse_usize(client_id, "silence_buffer_start_len", get("silence_buffer_start_len"))?;
    let accumulated_audio_bytes =
        parse_usize(client_id, "accumulated_audio_bytes", get("accumulated_audio_bytes"))?;

    Ok(SpeechSession {
        state: SpeechState::parse(get("state")),
        audio_buffer,
        pre_speech_buffer,
        silence_start_time: parse_optional_f64(get("silence_start_time")),
        session_start_time: parse_optional_f64(get("session_start_time")),
        last_published_len,
        silence_buffer_start_len,
        source_lang: non_empty_or(get("source_lang"), "en"),
        target_lang: non_empty_or(get("target_lang"), "en"),
        accumulated_audio_bytes,
        last_stt_send_time: parse_optional_f64(get("last_stt_send_time")),
    })
}

fn parse_usize(client_id: &str, field: &str, raw: &str) -> Result<usize, StoreError> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse().map_err(|_| StoreError::Corrupt {
        client_id: client_id.to_string(),
        reason: format!("field {field} had non-numeric value {raw:?}"),
    })
}

fn parse_optional_f64(raw: &str) -> Option<f64> {
    if raw.is_empty() {
        None
    } else {
        raw.parse().ok()
    }
}

fn non_empty_or(raw: &str, default: &str) -> String {
    if raw.is_empty() {
        default.to_string()
    } else {
        raw.to_string()
    }
}

/// In-memory store used by tests and by the fake collaborators in
/// `tests/pipeline.rs` — no external Redis required to exercise the
/// end-to-end scenarios there.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<ClientId, SpeechSession>>>,
    default_source_lang: String,
    default_target_lang: String,
}

impl InMemorySessionStore {
    pub fn new(default_source_lang: &str, default_target_lang: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            default_source_lang: default_source_lang.to_string(),
            default_target_lang: default_target_lang.to_string(),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, client_id: &ClientId) -> Result<SpeechSession, StoreError> {
        let map = self.inner.lock().await;
        Ok(map.get(client_id).cloned().unwrap_or_else(|| {
            SpeechSession::fresh(&self.default_source_lang, &self.default_target_lang)
        }))
    }

    async fn save(&self, client_id: &ClientId, session: &SpeechSession) -> Result<(), StoreError> {
        self.inner.lock().await.insert(client_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, client_id: &ClientId) -> Result<(), StoreError> {
        self.inner.lock().await.remove(client_id);
        Ok(())
    }
}

/// A store wrapper that always fails, used to test the transient-error path.
pub struct FailingSessionStore;

#[async_trait]
impl SessionStore for FailingSessionStore {
    async fn load(&self, _client_id: &ClientId) -> Result<SpeechSession, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
    async fn save(&self, _client_id: &ClientId, _session: &SpeechSession) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
    async fn delete(&self, _client_id: &ClientId) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_in_memory_store() {
        let store = InMemorySessionStore::new("en", "en");
        let client_id = "client-1".to_string();
        let mut session = SpeechSession::fresh("en", "vi");
        session.audio_buffer = vec![0, 1, 2, 255, 0, 254];
        session.pre_speech_buffer = vec![9, 9];
        session.last_published_len = 2;

        store.save(&client_id, &session).await.unwrap();
        let loaded = store.load(&client_id).await.unwrap();
        assert_eq!(loaded, session);

        store.delete(&client_id).await.unwrap();
        let after_delete = store.load(&client_id).await.unwrap();
        assert_eq!(after_delete, SpeechSession::fresh("en", "en"));
    }

    #[test]
    fn decode_session_rejects_non_numeric_marker() {
        let mut fields = HashMap::new();
        fields.insert("last_published_len".to_string(), "not-a-number".to_string());
        let err = decode_session("client-1", &fields, vec![], vec![]).unwrap_err();
        matches!(err, StoreError::Corrupt { .. });
    }

    #[test]
    fn encode_then_decode_round_trips_binary_unclean_buffers() {
        let mut session = SpeechSession::fresh("en", "vi");
        // NUL bytes, a lone high bit, and a few non-UTF8 byte sequences —
        // the scalar hash encoding must never touch these; they only ever
        // pass through as raw bytes on the separate buffer keys.
        session.audio_buffer = vec![0x00, 0xFF, 0x00, 0xC3, 0x28, 0x00, 0xE2, 0x82];
        session.pre_speech_buffer = vec![0x00, 0x00, 0xED, 0xA0, 0x80];
        session.state = SpeechState::Silence;
        session.silence_start_time = Some(12.5);
        session.session_start_time = Some(1.0);
        session.last_published_len = 3;
        session.silence_buffer_start_len = 2;
        session.accumulated_audio_bytes = 4096;
        session.last_stt_send_time = Some(99.75);

        let fields: HashMap<String, String> = encode_session(&session).into_iter().collect();
        let decoded = decode_session(
            "client-1",
            &fields,
            session.audio_buffer.clone(),
            session.pre_speech_buffer.clone(),
        )
        .unwrap();

        assert_eq!(decoded, session);
    }

    #[test]
    fn decode_session_handles_empty_optional_timestamps() {
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), "active".to_string());
        fields.insert("silence_start_time".to_string(), "".to_string());
        let session = decode_session("client-1", &fields, vec![], vec![]).unwrap();
        assert_eq!(session.state, SpeechState::Active);
        assert_eq!(session.silence_start_time, None);
    }
}
