//! Dual-VAD detector — combines a fast coarse detector and a slower precise
//! detector; the combined verdict is their logical AND.

pub mod coarse;
pub mod precise;

use crate::error::VadError;

pub use coarse::CoarseDetector;
pub use precise::PreciseDetector;

/// A single chunk classifier. Both the coarse and precise detectors
/// implement this so `DualVad` can treat them uniformly.
pub trait SpeechDetector: Send + Sync {
    /// Classify one PCM chunk (16 kHz, 16-bit, mono) as speech/non-speech.
    fn detect(&self, chunk: &[u8]) -> Result<bool, VadError>;
}

/// Combines the coarse and precise detectors; returns TRUE only when both
/// agree. `detect_speech_activity` runs them synchronously since both
/// detectors are CPU-bound and fast enough not to need a dedicated executor
/// for this chunk size.
pub struct DualVad {
    coarse: CoarseDetector,
    precise: PreciseDetector,
}

impl DualVad {
    pub fn new(coarse: CoarseDetector, precise: PreciseDetector) -> Self {
        Self { coarse, precise }
    }

    /// Run both detectors against the current chunk and AND the verdicts.
    /// The coarse pass runs first since it is allowed to early-out; the
    /// precise pass is only skipped when the coarse pass already says
    /// "no speech", since the AND can never become true regardless of what
    /// the precise detector reports.
    pub fn detect_speech_activity(&self, chunk: &[u8]) -> Result<bool, VadError> {
        if chunk.is_empty() {
            return Ok(false);
        }
        let coarse_speech = self.coarse.detect(chunk)?;
        if !coarse_speech {
            return Ok(false);
        }
        let precise_speech = self.precise.detect(chunk)?;
        Ok(coarse_speech && precise_speech)
    }
}
