//! Error types for the gateway.
//!
//! Each subsystem gets its own error enum so callers can match on failure
//! kind instead of routing everything through a bare `anyhow::Error`.

use thiserror::Error;

/// Errors surfaced by the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session store returned malformed data for {client_id}: {reason}")]
    Corrupt { client_id: String, reason: String },
}

/// Errors surfaced by the dual-VAD detector.
#[derive(Debug, Error)]
pub enum VadError {
    #[error("failed to initialize {which} detector: {reason}")]
    InitFailed { which: &'static str, reason: String },
    #[error("{which} detector failed on chunk: {reason}")]
    InferenceFailed { which: &'static str, reason: String },
}

/// Errors surfaced by the job/result bus transport.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("failed to publish to {stream}: {reason}")]
    PublishFailed { stream: String, reason: String },
}

/// Top-level error type the gateway's entrypoint deals in.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vad(#[from] VadError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("invalid client protocol message: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
}
