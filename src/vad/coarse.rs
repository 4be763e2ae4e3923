//! Coarse detector: fast, frame-based, early-out speech classifier.
//! Each 10ms frame at 16 kHz (160 samples) is scored by energy, and the
//! chunk is classified speech as soon as any frame crosses the
//! sensitivity-scaled threshold.

use crate::error::VadError;
use crate::vad::SpeechDetector;

/// Frame length in samples: 10ms at 16 kHz.
pub const FRAME_SAMPLES: usize = 160;
const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// RMS energy threshold (0.0-1.0 of full scale) for each sensitivity level,
/// 0 = least aggressive (requires louder speech) .. 3 = most aggressive.
const THRESHOLDS: [f32; 4] = [0.06, 0.04, 0.025, 0.015];

pub struct CoarseDetector {
    threshold: f32,
}

impl CoarseDetector {
    /// `sensitivity` is 0-3 (`WEBRTC_SENSITIVITY`); values outside that
    /// range clamp to the nearest valid level.
    pub fn new(sensitivity: u8) -> Self {
        let level = sensitivity.min(3) as usize;
        Self {
            threshold: THRESHOLDS[level],
        }
    }
}

impl SpeechDetector for CoarseDetector {
    fn detect(&self, chunk: &[u8]) -> Result<bool, VadError> {
        if chunk.len() < 2 {
            return Ok(false);
        }
        for frame in chunk.chunks(FRAME_BYTES) {
            if frame.len() < 2 {
                continue;
            }
            let samples = frame.len() / 2;
            let mut sum_sq: f64 = 0.0;
            for i in 0..samples {
                let lo = frame[i * 2];
                let hi = frame[i * 2 + 1];
                let sample = i16::from_le_bytes([lo, hi]) as f64 / i16::MAX as f64;
                sum_sq += sample * sample;
            }
            let rms = (sum_sq / samples as f64).sqrt() as f32;
            if rms >= self.threshold {
                // Early-out: one speech frame is enough.
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence_chunk(frames: usize) -> Vec<u8> {
        vec![0u8; frames * FRAME_BYTES]
    }

    fn loud_chunk(frames: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(frames * FRAME_BYTES);
        for _ in 0..(frames * FRAME_SAMPLES) {
            buf.extend_from_slice(&(i16::MAX / 2).to_le_bytes());
        }
        buf
    }

    #[test]
    fn silence_is_not_speech_at_any_sensitivity() {
        for sensitivity in 0..=3 {
            let detector = CoarseDetector::new(sensitivity);
            assert!(!detector.detect(&silence_chunk(3)).unwrap());
        }
    }

    #[test]
    fn loud_frame_is_speech_at_any_sensitivity() {
        for sensitivity in 0..=3 {
            let detector = CoarseDetector::new(sensitivity);
            assert!(detector.detect(&loud_chunk(1)).unwrap());
        }
    }

    #[test]
    fn early_out_returns_true_on_first_speech_frame() {
        let mut chunk = silence_chunk(5);
        let loud = loud_chunk(1);
        chunk[0..loud.len()].copy_from_slice(&loud);
        let detector = CoarseDetector::new(3);
        assert!(detector.detect(&chunk).unwrap());
    }

    #[test]
    fn higher_sensitivity_is_more_aggressive() {
        // A moderate-volume chunk should trip sensitivity 3 before 0.
        let mut buf = Vec::new();
        for _ in 0..FRAME_SAMPLES {
            buf.extend_from_slice(&((i16::MAX as f32 * 0.02) as i16).to_le_bytes());
        }
        let lenient = CoarseDetector::new(0);
        let aggressive = CoarseDetector::new(3);
        assert!(!lenient.detect(&buf).unwrap() || aggressive.detect(&buf).unwrap());
    }

    #[test]
    fn empty_and_truncated_chunks_are_silence() {
        let detector = CoarseDetector::new(3);
        assert!(!detector.detect(&[]).unwrap());
        assert!(!detector.detect(&[0]).unwrap());
    }
}
