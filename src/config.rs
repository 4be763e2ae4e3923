//! Configuration management.
//!
//! A single immutable `Config` is read once at startup from the environment
//! and passed by `Arc` into every component. No runtime mutation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GatewayError;

/// Fixed sample rate the whole pipeline operates at. Not configurable: every
/// producer and consumer in the pipeline assumes 16 kHz mono PCM.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes per sample for 16-bit mono PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Silence duration that ends an utterance and triggers a forced final job.
    #[serde(default = "default_silence_threshold_seconds")]
    pub silence_threshold_seconds: f64,

    /// WebRTC-style coarse detector sensitivity, 0 (least) .. 3 (most aggressive).
    #[serde(default = "default_webrtc_sensitivity")]
    pub webrtc_sensitivity: u8,

    /// Precise detector sensitivity; verdict threshold is `1 - silero_sensitivity`.
    #[serde(default = "default_silero_sensitivity")]
    pub silero_sensitivity: f64,

    /// Rolling pre-speech buffer length, in seconds.
    #[serde(default = "default_pre_speech_buffer_seconds")]
    pub pre_speech_buffer_seconds: f64,

    /// Minimum amount of new speech (seconds) required before a non-final
    /// job may be published.
    #[serde(default = "default_minimum_new_audio_seconds")]
    pub minimum_new_audio_seconds: f64,

    /// Buffer length (seconds) past which an overflow final job is forced.
    #[serde(default = "default_max_audio_buffer_seconds")]
    pub max_audio_buffer_seconds: f64,

    /// Job stream depth above which publishes are dropped (backpressure).
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u64,

    /// Whether buffer overflow sends a forced final job before resetting.
    #[serde(default = "default_send_final_job_on_max_buffer")]
    pub send_final_job_on_max_buffer: bool,

    /// Session TTL in the store, refreshed on every save.
    #[serde(default = "default_session_expiration_seconds")]
    pub session_expiration_seconds: u64,

    /// Default source language applied to freshly-initialized sessions.
    #[serde(default = "default_source_language")]
    pub default_source_language: String,

    /// Default target language applied to freshly-initialized sessions.
    #[serde(default = "default_target_language")]
    pub default_target_language: String,

    /// Redis connection string backing the session store, job stream, and
    /// result pub/sub channels.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream name audio jobs are appended to.
    #[serde(default = "default_audio_jobs_stream")]
    pub audio_jobs_stream: String,

    /// Stream name STT workers append transcriptions to for translation.
    #[serde(default = "default_transcriptions_stream")]
    pub transcriptions_stream: String,

    /// Prefix of the per-client pub/sub result channel.
    #[serde(default = "default_results_channel_prefix")]
    pub results_channel_prefix: String,

    /// Prefix of the per-client session hash/buffer keys.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,

    /// Host the gateway's WebSocket server binds to.
    #[serde(default = "default_gateway_host")]
    pub gateway_host: String,

    /// Port the gateway's WebSocket server binds to.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    /// Identity of this gateway process, stamped onto published jobs so a
    /// worker result can be traced back to its originating instance.
    #[serde(default = "default_instance_id")]
    pub gateway_instance: String,

    /// In-process session read-through cache TTL.
    #[serde(default = "default_session_cache_ttl_seconds")]
    pub session_cache_ttl_seconds: u64,
}

fn default_silence_threshold_seconds() -> f64 {
    1.0
}
fn default_webrtc_sensitivity() -> u8 {
    3
}
fn default_silero_sensitivity() -> f64 {
    0.7
}
fn default_pre_speech_buffer_seconds() -> f64 {
    2.0
}
fn default_minimum_new_audio_seconds() -> f64 {
    1.0
}
fn default_max_audio_buffer_seconds() -> f64 {
    10.0
}
fn default_max_queue_depth() -> u64 {
    100
}
fn default_send_final_job_on_max_buffer() -> bool {
    true
}
fn default_session_expiration_seconds() -> u64 {
    900
}
fn default_source_language() -> String {
    "en".to_string()
}
fn default_target_language() -> String {
    "en".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_audio_jobs_stream() -> String {
    "audio_jobs".to_string()
}
fn default_transcriptions_stream() -> String {
    "transcriptions".to_string()
}
fn default_results_channel_prefix() -> String {
    "results:".to_string()
}
fn default_session_prefix() -> String {
    "session:".to_string()
}
fn default_gateway_host() -> String {
    "0.0.0.0".to_string()
}
fn default_gateway_port() -> u16 {
    8765
}
fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
fn default_session_cache_ttl_seconds() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            silence_threshold_seconds: default_silence_threshold_seconds(),
            webrtc_sensitivity: default_webrtc_sensitivity(),
            silero_sensitivity: default_silero_sensitivity(),
            pre_speech_buffer_seconds: default_pre_speech_buffer_seconds(),
            minimum_new_audio_seconds: default_minimum_new_audio_seconds(),
            max_audio_buffer_seconds: default_max_audio_buffer_seconds(),
            max_queue_depth: default_max_queue_depth(),
            send_final_job_on_max_buffer: default_send_final_job_on_max_buffer(),
            session_expiration_seconds: default_session_expiration_seconds(),
            default_source_language: default_source_language(),
            default_target_language: default_target_language(),
            redis_url: default_redis_url(),
            audio_jobs_stream: default_audio_jobs_stream(),
            transcriptions_stream: default_transcriptions_stream(),
            results_channel_prefix: default_results_channel_prefix(),
            session_prefix: default_session_prefix(),
            gateway_host: default_gateway_host(),
            gateway_port: default_gateway_port(),
            gateway_instance: default_instance_id(),
            session_cache_ttl_seconds: default_session_cache_ttl_seconds(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// documented defaults for anything unset. Fails fast on malformed
    /// values so a bad deploy never starts serving with silently-wrong
    /// tuning.
    pub fn from_env() -> Result<Self, GatewayError> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("SILENCE_THRESHOLD_SECONDS") {
            cfg.silence_threshold_seconds = parse_env("SILENCE_THRESHOLD_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("WEBRTC_SENSITIVITY") {
            let parsed: u8 = parse_env("WEBRTC_SENSITIVITY", &v)?;
            if parsed > 3 {
                return Err(GatewayError::Config(format!(
                    "WEBRTC_SENSITIVITY must be 0-3, got {parsed}"
                )));
            }
            cfg.webrtc_sensitivity = parsed;
        }
        if let Ok(v) = std::env::var("SILERO_SENSITIVITY") {
            let parsed: f64 = parse_env("SILERO_SENSITIVITY", &v)?;
            if !(0.0..=1.0).contains(&parsed) {
                return Err(GatewayError::Config(format!(
                    "SILERO_SENSITIVITY must be 0.0-1.0, got {parsed}"
                )));
            }
            cfg.silero_sensitivity = parsed;
        }
        if let Ok(v) = std::env::var("PRE_SPEECH_BUFFER_SECONDS") {
            cfg.pre_speech_buffer_seconds = parse_env("PRE_SPEECH_BUFFER_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("MINIMUM_NEW_AUDIO_SECONDS") {
            cfg.minimum_new_audio_seconds = parse_env("MINIMUM_NEW_AUDIO_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("MAX_AUDIO_BUFFER_SECONDS") {
            cfg.max_audio_buffer_seconds = parse_env("MAX_AUDIO_BUFFER_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("MAX_QUEUE_DEPTH") {
            cfg.max_queue_depth = parse_env("MAX_QUEUE_DEPTH", &v)?;
        }
        if let Ok(v) = std::env::var("SEND_FINAL_JOB_ON_MAX_BUFFER") {
            cfg.send_final_job_on_max_buffer = parse_bool_env(&v);
        }
        if let Ok(v) = std::env::var("SESSION_EXPIRATION_SECONDS") {
            cfg.session_expiration_seconds = parse_env("SESSION_EXPIRATION_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("DEFAULT_SOURCE_LANGUAGE") {
            cfg.default_source_language = v;
        }
        if let Ok(v) = std::env::var("DEFAULT_TARGET_LANGUAGE") {
            cfg.default_target_language = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Ok(v) = std::env::var("AUDIO_JOBS_STREAM") {
            cfg.audio_jobs_stream = v;
        }
        if let Ok(v) = std::env::var("TRANSCRIPTIONS_STREAM") {
            cfg.transcriptions_stream = v;
        }
        if let Ok(v) = std::env::var("RESULTS_CHANNEL_PREFIX") {
            cfg.results_channel_prefix = v;
        }
        if let Ok(v) = std::env::var("SESSION_PREFIX") {
            cfg.session_prefix = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_HOST") {
            cfg.gateway_host = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_PORT") {
            cfg.gateway_port = parse_env("GATEWAY_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("GATEWAY_INSTANCE_ID") {
            cfg.gateway_instance = v;
        }

        Ok(cfg)
    }

    pub fn max_audio_buffer_bytes(&self) -> usize {
        (self.max_audio_buffer_seconds * SAMPLE_RATE as f64 * BYTES_PER_SAMPLE as f64) as usize
    }

    pub fn pre_speech_buffer_max_bytes(&self) -> usize {
        (self.pre_speech_buffer_seconds * SAMPLE_RATE as f64 * BYTES_PER_SAMPLE as f64) as usize
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.silence_threshold_seconds.max(0.0))
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.session_cache_ttl_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, GatewayError> {
    raw.parse::<T>()
        .map_err(|_| GatewayError::Config(format!("invalid value for {name}: {raw:?}")))
}

fn parse_bool_env(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
