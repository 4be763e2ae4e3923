//! Job dispatcher: decides whether to publish an audio job now, and does so.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::AudioJobStream;
use crate::config::{Config, BYTES_PER_SAMPLE, SAMPLE_RATE};
use crate::envelopes::JobEnvelope;
use crate::error::BusError;
use crate::session::SpeechSession;

pub struct JobDispatcher {
    stream: Arc<dyn AudioJobStream>,
    config: Arc<Config>,
}

/// Why a publish attempt did or did not happen, for callers that need to
/// react (e.g. flip `in_flight`, log, or retry a catch-up publish later).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published { is_final: bool },
    SkippedNoNewData,
    SkippedBelowMinimumNewSpeech,
    SkippedJobInFlight,
    SkippedInSilencePeriod,
    SkippedQueueFull,
}

impl JobDispatcher {
    pub fn new(stream: Arc<dyn AudioJobStream>, config: Arc<Config>) -> Self {
        Self { stream, config }
    }

    /// Bytes of audio accumulated after the session's most recent silence
    /// marker, in excess of what has already been published — the portion
    /// that counts toward the minimum-new-speech threshold.
    fn new_speech_bytes(session: &SpeechSession) -> usize {
        if session.silence_buffer_start_len > session.last_published_len {
            session
                .audio_buffer
                .len()
                .saturating_sub(session.silence_buffer_start_len)
        } else {
            session
                .audio_buffer
                .len()
                .saturating_sub(session.last_published_len)
        }
    }

    fn new_speech_seconds(&self, session: &SpeechSession) -> f64 {
        Self::new_speech_bytes(session) as f64 / (SAMPLE_RATE as f64 * BYTES_PER_SAMPLE as f64)
    }

    /// Attempt a non-final, opportunistic publish. Returns without touching
    /// `in_flight` unless it actually publishes.
    pub async fn maybe_publish(
        &self,
        client_id: &str,
        session: &mut SpeechSession,
        in_flight: bool,
    ) -> Result<DispatchOutcome, BusError> {
        self.publish_if_eligible(client_id, session, in_flight, false, false).await
    }

    /// Force a final publish regardless of eligibility gates 1/3/4 — used
    /// for silence timeout, buffer overflow, and client-initiated flushes.
    /// Gate 2 (there must be *some* new data) still applies.
    pub async fn force_final_publish(
        &self,
        client_id: &str,
        session: &mut SpeechSession,
    ) -> Result<DispatchOutcome, BusError> {
        self.publish_if_eligible(client_id, session, false, true, true).await
    }

    async fn publish_if_eligible(
        &self,
        client_id: &str,
        session: &mut SpeechSession,
        in_flight: bool,
        is_final: bool,
        force: bool,
    ) -> Result<DispatchOutcome, BusError> {
        let buffer_has_new_data = session.audio_buffer.len() > session.last_published_len;
        if !buffer_has_new_data {
            debug!(client_id, "no new audio data to publish");
            return Ok(DispatchOutcome::SkippedNoNewData);
        }

        if !force {
            if in_flight {
                debug!(client_id, "previous job still in flight");
                return Ok(DispatchOutcome::SkippedJobInFlight);
            }
            if self.new_speech_seconds(session) < self.config.minimum_new_audio_seconds {
                debug!(client_id, "below minimum new speech threshold");
                return Ok(DispatchOutcome::SkippedBelowMinimumNewSpeech);
            }
            let in_silence_period = session.silence_buffer_start_len > 0
                && session.audio_buffer.len() > session.silence_buffer_start_len
                && session.silence_start_time.is_some();
            if in_silence_period {
                debug!(client_id, "in silence period, holding publish");
                return Ok(DispatchOutcome::SkippedInSilencePeriod);
            }
        }

        let depth = self.stream.stream_depth().await?;
        if depth > self.config.max_queue_depth {
            warn!(client_id, depth, limit = self.config.max_queue_depth, "queue depth exceeds threshold, dropping publish");
            return Ok(DispatchOutcome::SkippedQueueFull);
        }

        // Default policy: send the full accumulated buffer, not just the
        // delta, so every job carries complete utterance context.
        let job = JobEnvelope {
            job_id: format!("{client_id}_{}", &Uuid::new_v4().simple().to_string()[..8]),
            client_id: client_id.to_string(),
            segment_id: segment_id_now(),
            audio_bytes_b64: base64_encode(&session.audio_buffer),
            sample_rate: SAMPLE_RATE,
            source_lang: session.source_lang.clone(),
            target_lang: session.target_lang.clone(),
            translation_enabled: session.translation_enabled(),
            is_final,
            timestamp: timestamp_now(),
            gateway_instance: self.config.gateway_instance.clone(),
        };

        self.stream.publish(&job).await?;
        session.last_published_len = session.audio_buffer.len();
        session.silence_buffer_start_len = 0;
        session.last_stt_send_time = Some(job.timestamp);

        info!(client_id, job_id = %job.job_id, is_final, bytes = session.audio_buffer.len(), "audio job published");
        Ok(DispatchOutcome::Published { is_final })
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn segment_id_now() -> String {
    timestamp_millis().to_string()
}

fn timestamp_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn timestamp_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
