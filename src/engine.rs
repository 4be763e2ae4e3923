//! Speech-session engine: turns an inbound audio chunk plus a VAD verdict
//! into session state transitions and buffer mutations. Decides nothing
//! about whether/when to publish a job — that is the job dispatcher's
//! responsibility — but tells the caller when a forced final publish is due.

use tracing::{debug, warn};

use crate::config::Config;
use crate::session::{SpeechSession, SpeechState};

/// Signals a forced action the caller (gateway wiring) must take after a
/// chunk is processed; `Continue` means only the ordinary, opportunistic
/// publish check applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEvent {
    Continue,
    SilenceTimeout,
    BufferOverflow,
}

pub struct SpeechSessionEngine;

impl SpeechSessionEngine {
    /// Processes one chunk against `session`, mutating it in place, and
    /// returns the event the caller must react to. `now` is seconds since
    /// an arbitrary epoch (monotonic per caller); its only use is duration
    /// arithmetic between calls for the same client.
    pub fn process_chunk(
        session: &mut SpeechSession,
        chunk: &[u8],
        has_speech: bool,
        now: f64,
        config: &Config,
    ) -> ChunkEvent {
        // The pre-speech buffer is always maintained, even while inactive,
        // so the leading edge of speech is never lost to VAD lock-in lag.
        session.push_pre_speech(chunk, config.pre_speech_buffer_max_bytes());
        session.accumulated_audio_bytes += chunk.len();

        match (session.state, has_speech) {
            (SpeechState::Inactive, true) => {
                session.audio_buffer.extend_from_slice(&session.pre_speech_buffer.clone());
                session.start_speech(now);
                session.audio_buffer.extend_from_slice(chunk);
                debug!("speech activated, buffer seeded from pre-speech buffer");
            }
            (SpeechState::Inactive, false) => {
                // Rolling pre-speech buffer already updated above; nothing else to do.
            }
            (SpeechState::Active, true) => {
                session.silence_start_time = Some(now);
                session.audio_buffer.extend_from_slice(chunk);
            }
            (SpeechState::Active, false) => {
                session.silence_buffer_start_len = session.audio_buffer.len();
                session.audio_buffer.extend_from_slice(chunk);
                session.silence_start_time = Some(now);
                session.state = SpeechState::Silence;
                debug!("entering silence period");
            }
            (SpeechState::Silence, true) => {
                session.silence_buffer_start_len = session.audio_buffer.len();
                session.state = SpeechState::Active;
                session.silence_start_time = Some(now);
                session.audio_buffer.extend_from_slice(chunk);
                debug!("speech resumed from silence");
            }
            (SpeechState::Silence, false) => {
                session.audio_buffer.extend_from_slice(chunk);
            }
        }

        if session.state != SpeechState::Inactive
            && session.audio_buffer.len() > config.max_audio_buffer_bytes()
        {
            warn!(
                bytes = session.audio_buffer.len(),
                cap = config.max_audio_buffer_bytes(),
                "audio buffer exceeded configured cap"
            );
            return ChunkEvent::BufferOverflow;
        }

        if session.state == SpeechState::Silence {
            if let Some(silence_start) = session.silence_start_time {
                if now - silence_start >= config.silence_threshold_seconds {
                    return ChunkEvent::SilenceTimeout;
                }
            }
        }

        ChunkEvent::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            pre_speech_buffer_seconds: 0.01, // 160 bytes at 16kHz/16-bit
            silence_threshold_seconds: 1.0,
            max_audio_buffer_seconds: 0.02, // 640 bytes, small for overflow tests
            ..Config::default()
        }
    }

    fn chunk(n: usize) -> Vec<u8> {
        vec![7u8; n]
    }

    #[test]
    fn inactive_plus_speech_prepends_pre_speech_buffer_and_activates() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");
        session.pre_speech_buffer = vec![1, 2, 3, 4];

        let event = SpeechSessionEngine::process_chunk(&mut session, &[9, 9], true, 100.0, &cfg);

        assert_eq!(event, ChunkEvent::Continue);
        assert_eq!(session.state, SpeechState::Active);
        assert_eq!(session.audio_buffer, vec![1, 2, 3, 4, 9, 9]);
        assert_eq!(session.session_start_time, Some(100.0));
        assert_eq!(session.silence_start_time, Some(100.0));
    }

    #[test]
    fn inactive_plus_silence_only_grows_pre_speech_buffer() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");

        let event = SpeechSessionEngine::process_chunk(&mut session, &chunk(10), false, 1.0, &cfg);

        assert_eq!(event, ChunkEvent::Continue);
        assert_eq!(session.state, SpeechState::Inactive);
        assert!(session.audio_buffer.is_empty());
        assert_eq!(session.pre_speech_buffer.len(), 10);
    }

    #[test]
    fn active_plus_speech_resets_silence_timer() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");
        session.start_speech(0.0);
        session.audio_buffer = vec![1, 2, 3];

        SpeechSessionEngine::process_chunk(&mut session, &[4, 5], true, 5.0, &cfg);

        assert_eq!(session.state, SpeechState::Active);
        assert_eq!(session.silence_start_time, Some(5.0));
        assert_eq!(session.audio_buffer, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn active_plus_first_silent_chunk_transitions_to_silence_and_marks_len() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");
        session.start_speech(0.0);
        session.audio_buffer = vec![1, 2, 3, 4];

        SpeechSessionEngine::process_chunk(&mut session, &[9, 9], false, 2.0, &cfg);

        assert_eq!(session.state, SpeechState::Silence);
        assert_eq!(session.silence_buffer_start_len, 4);
        assert_eq!(session.silence_start_time, Some(2.0));
        assert_eq!(session.audio_buffer, vec![1, 2, 3, 4, 9, 9]);
    }

    #[test]
    fn silence_plus_speech_resumes_active_and_remarks_len() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");
        session.state = SpeechState::Silence;
        session.audio_buffer = vec![0; 8];
        session.silence_buffer_start_len = 4;
        session.silence_start_time = Some(2.0);

        SpeechSessionEngine::process_chunk(&mut session, &[1, 1], true, 3.0, &cfg);

        assert_eq!(session.state, SpeechState::Active);
        assert_eq!(session.silence_buffer_start_len, 8);
        assert_eq!(session.silence_start_time, Some(3.0));
    }

    #[test]
    fn silence_timeout_fires_once_threshold_elapsed() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");
        session.state = SpeechState::Silence;
        session.audio_buffer = vec![0; 4];
        session.silence_start_time = Some(10.0);

        let not_yet = SpeechSessionEngine::process_chunk(&mut session, &[1], false, 10.5, &cfg);
        assert_eq!(not_yet, ChunkEvent::Continue);

        let timed_out = SpeechSessionEngine::process_chunk(&mut session, &[1], false, 11.0, &cfg);
        assert_eq!(timed_out, ChunkEvent::SilenceTimeout);
    }

    #[test]
    fn buffer_overflow_detected_once_cap_exceeded() {
        let cfg = config();
        let mut session = SpeechSession::fresh("en", "en");
        session.start_speech(0.0);
        session.audio_buffer = vec![0; 700]; // already above the 640-byte cap

        let event = SpeechSessionEngine::process_chunk(&mut session, &[1, 2], true, 1.0, &cfg);
        assert_eq!(event, ChunkEvent::BufferOverflow);
    }
}
