//! ONNX synthesizer backend
//!
//! Wraps an `ort` session behind the [`Synthesizer`] seam. The model
//! contract is Kokoro-style: `input_ids [1, N] i64`, `style [1, S] f32`,
//! `speed [1] f32` in; `waveform [1, M] f32` out.

use async_trait::async_trait;
use ndarray::{Array1, Array2};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;

use lyra_core::{SpeechError, Style, Synthesizer};

/// Width of the style embedding the model expects
const STYLE_DIM: usize = 256;

pub struct OnnxSynthesizer {
    session: Mutex<Session>,
    sample_rate: u32,
}

impl OnnxSynthesizer {
    /// Load a model from disk
    pub fn from_file(model_path: &Path, sample_rate: u32) -> Result<Self, SpeechError> {
        let session = Session::builder()
            .map_err(|e| SpeechError::Internal(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| SpeechError::Internal(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e| SpeechError::Internal(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| SpeechError::Internal(e.to_string()))?;

        tracing::info!(model = %model_path.display(), "Loaded ONNX synthesizer");

        Ok(Self {
            session: Mutex::new(session),
            sample_rate,
        })
    }

    /// Deterministic style embedding derived from the voice name
    ///
    /// Stands in for a voices data file; deployments that ship voice packs
    /// replace this by loading the embedding for `style.voice`.
    fn style_vector(style: &Style) -> Vec<f32> {
        let mut seed: u64 = 0xcbf29ce484222325;
        for b in style.voice.bytes().chain(style.lang.bytes()) {
            seed ^= b as u64;
            seed = seed.wrapping_mul(0x100000001b3);
        }
        (0..STYLE_DIM)
            .map(|i| {
                let x = seed.wrapping_add(i as u64).wrapping_mul(0x2545F4914F6CDD1D);
                ((x >> 33) as f32 / u32::MAX as f32) - 0.5
            })
            .collect()
    }
}

#[async_trait]
impl Synthesizer for OnnxSynthesizer {
    async fn synthesize(
        &self,
        tokens: &[i64],
        style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let input = Array2::from_shape_vec((1, tokens.len()), tokens.to_vec())
            .map_err(|e| SpeechError::Internal(e.to_string()))?;
        let style_arr = Array2::from_shape_vec((1, STYLE_DIM), Self::style_vector(style))
            .map_err(|e| SpeechError::Internal(e.to_string()))?;
        let speed_arr = Array1::from_vec(vec![speed]);

        let samples = {
            let mut session = self.session.lock();
            let outputs = session
                .run(ort::inputs![
                    "input_ids" => Tensor::from_array(input)
                        .map_err(|e| SpeechError::Internal(e.to_string()))?,
                    "style" => Tensor::from_array(style_arr)
                        .map_err(|e| SpeechError::Internal(e.to_string()))?,
                    "speed" => Tensor::from_array(speed_arr)
                        .map_err(|e| SpeechError::Internal(e.to_string()))?,
                ])
                .map_err(|e| SpeechError::Internal(e.to_string()))?;

            let waveform = outputs["waveform"]
                .try_extract_array::<f32>()
                .map_err(|e| SpeechError::Internal(e.to_string()))?;
            waveform.iter().copied().collect::<Vec<f32>>()
        };

        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
