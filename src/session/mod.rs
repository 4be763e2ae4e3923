//! Per-client speech session state that the speech-session engine operates on.

pub mod store;

use serde::{Deserialize, Serialize};

use crate::config::{BYTES_PER_SAMPLE, SAMPLE_RATE};

/// Identifies a connected client across the gateway and the store.
pub type ClientId = String;

/// The three states a speech session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechState {
    Inactive,
    Active,
    Silence,
}

impl SpeechState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechState::Inactive => "inactive",
            SpeechState::Active => "active",
            SpeechState::Silence => "silence",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => SpeechState::Active,
            "silence" => SpeechState::Silence,
            _ => SpeechState::Inactive,
        }
    }
}

/// One per connected client. Audio buffers hold 16 kHz mono 16-bit
/// little-endian PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSession {
    pub state: SpeechState,
    pub audio_buffer: Vec<u8>,
    pub pre_speech_buffer: Vec<u8>,
    pub silence_start_time: Option<f64>,
    pub session_start_time: Option<f64>,
    pub last_published_len: usize,
    pub silence_buffer_start_len: usize,
    pub source_lang: String,
    pub target_lang: String,
    /// Bytes received since the current session began. Debug bookkeeping
    /// only — no gate branches on it.
    pub accumulated_audio_bytes: usize,
    /// Wall-clock time (seconds since epoch) of the last STT job published
    /// for this client. Debug bookkeeping only.
    pub last_stt_send_time: Option<f64>,
}

impl SpeechSession {
    /// A freshly initialized session, as returned by `load` for a
    /// never-seen or expired client.
    pub fn fresh(source_lang: &str, target_lang: &str) -> Self {
        Self {
            state: SpeechState::Inactive,
            audio_buffer: Vec::new(),
            pre_speech_buffer: Vec::new(),
            silence_start_time: None,
            session_start_time: None,
            last_published_len: 0,
            silence_buffer_start_len: 0,
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            accumulated_audio_bytes: 0,
            last_stt_send_time: None,
        }
    }

    /// Translation is enabled iff source and target languages differ.
    pub fn translation_enabled(&self) -> bool {
        self.source_lang != self.target_lang
    }

    pub fn buffer_seconds(&self) -> f64 {
        self.audio_buffer.len() as f64 / (SAMPLE_RATE as f64 * BYTES_PER_SAMPLE as f64)
    }

    pub fn pre_speech_buffer_seconds(&self) -> f64 {
        self.pre_speech_buffer.len() as f64 / (SAMPLE_RATE as f64 * BYTES_PER_SAMPLE as f64)
    }

    /// Transition taken on the first speech chunk while inactive or while
    /// resuming from silence.
    pub fn start_speech(&mut self, now: f64) {
        self.state = SpeechState::Active;
        self.session_start_time = Some(now);
        self.silence_start_time = Some(now);
    }

    /// Full reset on utterance end, `start_over`, or buffer overflow.
    pub fn end_speech_session(&mut self) {
        self.state = SpeechState::Inactive;
        self.audio_buffer.clear();
        self.pre_speech_buffer.clear();
        self.silence_start_time = None;
        self.session_start_time = None;
        self.last_published_len = 0;
        self.silence_buffer_start_len = 0;
        self.accumulated_audio_bytes = 0;
    }

    /// Append to the rolling pre-speech buffer, trimming to the configured
    /// cap from the front.
    pub fn push_pre_speech(&mut self, chunk: &[u8], max_bytes: usize) {
        self.pre_speech_buffer.extend_from_slice(chunk);
        if self.pre_speech_buffer.len() > max_bytes {
            let excess = self.pre_speech_buffer.len() - max_bytes;
            self.pre_speech_buffer.drain(0..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_inactive_and_empty() {
        let s = SpeechSession::fresh("en", "en");
        assert_eq!(s.state, SpeechState::Inactive);
        assert!(s.audio_buffer.is_empty());
        assert_eq!(s.last_published_len, 0);
        assert!(!s.translation_enabled());
    }

    #[test]
    fn translation_enabled_when_languages_differ() {
        let s = SpeechSession::fresh("en", "vi");
        assert!(s.translation_enabled());
    }

    #[test]
    fn pre_speech_buffer_trims_from_front() {
        let mut s = SpeechSession::fresh("en", "en");
        s.push_pre_speech(&[1, 2, 3, 4], 4);
        s.push_pre_speech(&[5, 6], 4);
        assert_eq!(s.pre_speech_buffer, vec![3, 4, 5, 6]);
    }

    #[test]
    fn end_speech_session_clears_everything() {
        let mut s = SpeechSession::fresh("en", "en");
        s.audio_buffer = vec![1, 2, 3];
        s.last_published_len = 2;
        s.silence_buffer_start_len = 1;
        s.silence_start_time = Some(10.0);
        s.end_speech_session();
        assert_eq!(s, SpeechSession::fresh("en", "en"));
    }
}
