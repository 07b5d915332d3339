//! Synthesizer backends
//!
//! The engine treats the inference kernel as opaque. Production builds load
//! the ONNX backend (feature `onnx`); tests and model-less deployments use
//! the deterministic backends here, which map token sequences to silence or
//! tones so stream-level properties stay byte-checkable.

#[cfg(feature = "onnx")]
pub mod onnx;

use async_trait::async_trait;
use std::sync::Arc;

use lyra_core::{SpeechError, Style, Synthesizer};

/// Samples of output per input token at the native rate
///
/// Roughly 12.5 ms per phoneme at 24 kHz, which lands short utterances in
/// a natural-sounding duration band.
const SAMPLES_PER_TOKEN: usize = 300;

/// Backend selection for a session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Deterministic silence (model-less default)
    Silence,
    /// Deterministic tones keyed by token id
    Tone,
    /// ONNX model (requires the `onnx` feature and a model path)
    #[cfg(feature = "onnx")]
    Onnx,
}

/// Silence backend: correct durations, zero amplitude
pub struct SilenceSynthesizer {
    sample_rate: u32,
}

impl SilenceSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl Synthesizer for SilenceSynthesizer {
    async fn synthesize(
        &self,
        tokens: &[i64],
        _style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        let per_token = (SAMPLES_PER_TOKEN as f32 / speed.max(0.01)) as usize;
        Ok(vec![0.0; tokens.len() * per_token])
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Tone backend: each token becomes a short sine burst whose frequency is a
/// pure function of the token id, so identical requests produce identical
/// PCM end to end
pub struct ToneSynthesizer {
    sample_rate: u32,
}

impl ToneSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    async fn synthesize(
        &self,
        tokens: &[i64],
        _style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        let per_token = (SAMPLES_PER_TOKEN as f32 / speed.max(0.01)) as usize;
        let mut samples = Vec::with_capacity(tokens.len() * per_token);

        for &token in tokens {
            let freq = 220.0 + (token.rem_euclid(32) as f32) * 20.0;
            let step = std::f32::consts::TAU * freq / self.sample_rate as f32;
            for n in 0..per_token {
                samples.push(0.3 * (step * n as f32).sin());
            }
        }
        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Synthesizer that fails on demand; test-only hook for pool health paths
pub struct FlakySynthesizer {
    inner: ToneSynthesizer,
    failures_remaining: parking_lot::Mutex<u32>,
}

impl FlakySynthesizer {
    pub fn failing_times(n: u32, sample_rate: u32) -> Self {
        Self {
            inner: ToneSynthesizer::new(sample_rate),
            failures_remaining: parking_lot::Mutex::new(n),
        }
    }
}

#[async_trait]
impl Synthesizer for FlakySynthesizer {
    async fn synthesize(
        &self,
        tokens: &[i64],
        style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SpeechError::SynthesisFailed {
                    segment_id: 0,
                    reason: "injected failure".to_string(),
                });
            }
        }
        self.inner.synthesize(tokens, style, speed).await
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }
}

/// Build a backend for a session slot
pub fn create_synthesizer(
    kind: BackendKind,
    sample_rate: u32,
    #[cfg(feature = "onnx")] model_path: Option<&std::path::Path>,
) -> Result<Arc<dyn Synthesizer>, SpeechError> {
    match kind {
        BackendKind::Silence => Ok(Arc::new(SilenceSynthesizer::new(sample_rate))),
        BackendKind::Tone => Ok(Arc::new(ToneSynthesizer::new(sample_rate))),
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => {
            let path = model_path.ok_or_else(|| {
                SpeechError::Internal("onnx backend requires a model path".to_string())
            })?;
            Ok(Arc::new(onnx::OnnxSynthesizer::from_file(path, sample_rate)?))
        },
    }
}
