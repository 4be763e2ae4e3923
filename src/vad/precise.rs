//! Precise detector: ONNX-backed speech probability scorer. Scores every
//! complete and half-overlapping 512-sample window in a chunk, zero-pads
//! short chunks, and returns the maximum probability seen. Recurrent state
//! is local to one `detect()` call — each chunk gets a fresh hidden state,
//! so a call can never return a verdict influenced by a previous, unrelated
//! chunk.

use std::path::PathBuf;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Value;
use tracing::{info, warn};

use crate::error::VadError;
use crate::vad::SpeechDetector;

const MODEL_URL: &str =
    "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
const MODEL_FILENAME: &str = "silero_vad.onnx";
const WINDOW_SIZE: usize = 512;
const WINDOW_STEP: usize = WINDOW_SIZE / 2; // half-overlapping windows
const SAMPLE_RATE_I64: i64 = 16_000;
const HIDDEN_STATE_LEN: usize = 2 * 1 * 128;

enum Backend {
    Onnx(Mutex<Session>),
    /// Energy-based stand-in used in tests so the detector's AND-logic and
    /// windowing behavior can be exercised without an ONNX Runtime install
    /// or a downloaded model file.
    EnergyStub,
}

pub struct PreciseDetector {
    backend: Backend,
    /// Verdict threshold: probability must exceed `1 - SILERO_SENSITIVITY`.
    threshold: f32,
}

impl PreciseDetector {
    /// Load (downloading if needed) the ONNX model and build a real
    /// detector. Fails fast: an init error here should stop the process
    /// rather than let it serve with a detector that always says silence.
    pub fn new(sensitivity: f64) -> Result<Self, VadError> {
        let model_path = Self::ensure_model()?;
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(&model_path))
            .map_err(|e| VadError::InitFailed {
                which: "precise",
                reason: e.to_string(),
            })?;
        info!(path = %model_path.display(), "precise VAD model loaded");
        Ok(Self {
            backend: Backend::Onnx(Mutex::new(session)),
            threshold: (1.0 - sensitivity.clamp(0.0, 1.0)) as f32,
        })
    }

    /// Test-only constructor bypassing ONNX Runtime entirely.
    pub fn new_stub(sensitivity: f64) -> Self {
        Self {
            backend: Backend::EnergyStub,
            threshold: (1.0 - sensitivity.clamp(0.0, 1.0)) as f32,
        }
    }

    fn ensure_model() -> Result<PathBuf, VadError> {
        let model_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("speechway-gateway")
            .join("models");
        std::fs::create_dir_all(&model_dir).map_err(|e| VadError::InitFailed {
            which: "precise",
            reason: format!("could not create model dir: {e}"),
        })?;

        let model_path = model_dir.join(MODEL_FILENAME);
        if model_path.exists() {
            return Ok(model_path);
        }

        warn!(url = MODEL_URL, "downloading precise VAD model");
        let response = reqwest_blocking_get(MODEL_URL).map_err(|e| VadError::InitFailed {
            which: "precise",
            reason: format!("download failed: {e}"),
        })?;
        std::fs::write(&model_path, response).map_err(|e| VadError::InitFailed {
            which: "precise",
            reason: format!("could not save model: {e}"),
        })?;
        Ok(model_path)
    }

    fn windows(samples: &[f32]) -> Vec<[f32; WINDOW_SIZE]> {
        if samples.len() <= WINDOW_SIZE {
            let mut padded = [0.0f32; WINDOW_SIZE];
            padded[..samples.len()].copy_from_slice(samples);
            return vec![padded];
        }
        let mut out = Vec::new();
        let mut start = 0;
        while start + WINDOW_SIZE <= samples.len() {
            let mut window = [0.0f32; WINDOW_SIZE];
            window.copy_from_slice(&samples[start..start + WINDOW_SIZE]);
            out.push(window);
            start += WINDOW_STEP;
        }
        if out.is_empty() {
            let mut padded = [0.0f32; WINDOW_SIZE];
            padded[..samples.len()].copy_from_slice(samples);
            out.push(padded);
        }
        out
    }

    fn score_onnx(session: &Mutex<Session>, window: &[f32; WINDOW_SIZE], state: &mut Vec<f32>) -> Result<f32, VadError> {
        let mut session = session.lock().expect("precise VAD session lock poisoned");
        let input = Value::from_array(([1usize, WINDOW_SIZE], window.to_vec())).map_err(onnx_err)?;
        let state_value = Value::from_array(([2usize, 1usize, 128usize], state.clone())).map_err(onnx_err)?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE_I64])).map_err(onnx_err)?;

        let outputs = session
            .run(ort::inputs![input, state_value, sr])
            .map_err(onnx_err)?;

        let (_, prob_data) = outputs[0].try_extract_tensor::<f32>().map_err(onnx_err)?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        let (_, new_state) = outputs[1].try_extract_tensor::<f32>().map_err(onnx_err)?;
        if new_state.len() == HIDDEN_STATE_LEN {
            state.copy_from_slice(new_state);
        }

        Ok(prob)
    }

    fn score_stub(window: &[f32; WINDOW_SIZE]) -> f32 {
        let sum_sq: f32 = window.iter().map(|s| s * s).sum();
        (sum_sq / WINDOW_SIZE as f32).sqrt().min(1.0)
    }
}

impl SpeechDetector for PreciseDetector {
    fn detect(&self, chunk: &[u8]) -> Result<bool, VadError> {
        if chunk.len() < 2 {
            return Ok(false);
        }
        let samples = i16_le_to_f32(chunk);
        let windows = Self::windows(&samples);

        let mut max_prob = 0.0f32;
        let mut state = vec![0.0f32; HIDDEN_STATE_LEN];
        for window in &windows {
            let prob = match &self.backend {
                Backend::Onnx(session) => Self::score_onnx(session, window, &mut state)?,
                Backend::EnergyStub => Self::score_stub(window),
            };
            max_prob = max_prob.max(prob);
        }

        Ok(max_prob > self.threshold)
    }
}

fn i16_le_to_f32(chunk: &[u8]) -> Vec<f32> {
    chunk
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect()
}

fn onnx_err(e: ort::Error) -> VadError {
    VadError::InferenceFailed {
        which: "precise",
        reason: e.to_string(),
    }
}

fn reqwest_blocking_get(url: &str) -> Result<Vec<u8>, anyhow::Error> {
    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    Ok(response.bytes()?.to_vec())
}
