//! Seams to the opaque collaborators
//!
//! The inference kernel, grapheme-to-phoneme conversion, and hardware
//! probing live behind these traits. The engine never sees past them; test
//! builds swap in deterministic implementations.

use async_trait::async_trait;

use crate::error::SpeechError;

/// Token sequence handed from G2P to the synthesizer
pub type TokenSeq = Vec<i64>;

/// Voice style reference resolved from `(voice, lang)` by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    pub voice: String,
    pub lang: String,
}

/// Opaque neural inference kernel: `(tokens, style, speed) -> PCM`
///
/// One call is atomic; cancellation drops the result but never interrupts
/// the native invocation mid-call.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize f32 samples (normalized to [-1.0, 1.0]) at `sample_rate()`
    async fn synthesize(
        &self,
        tokens: &[i64],
        style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError>;

    /// Native output sample rate
    fn sample_rate(&self) -> u32;

    /// Short trivial inference used by warmup and keep-alive
    async fn warm(&self) -> Result<(), SpeechError> {
        self.synthesize(
            &[0, 1, 0],
            &Style {
                voice: "af_heart".into(),
                lang: "en-us".into(),
            },
            1.0,
        )
        .await
        .map(|_| ())
    }

    /// Release accelerator context held between calls; called by the scoped
    /// cleanup on idle transitions
    async fn release(&self) -> Result<(), SpeechError> {
        Ok(())
    }
}

/// Opaque grapheme-to-phoneme converter
#[async_trait]
pub trait G2p: Send + Sync {
    async fn to_tokens(&self, text: &str, lang: &str) -> Result<TokenSeq, SpeechError>;
}

/// Rough capability report for the host machine
#[derive(Debug, Clone, Default)]
pub struct HardwareReport {
    pub has_accelerator: bool,
    pub has_coprocessor: bool,
    pub memory_mb: u64,
    pub cpu_cores: usize,
}

/// Opaque hardware capability probe
pub trait HardwareProbe: Send + Sync {
    fn probe(&self) -> HardwareReport;
}

/// Probe that reports a generic CPU-only machine; the default when no
/// platform probe is wired in
#[derive(Debug, Default)]
pub struct GenericProbe;

impl HardwareProbe for GenericProbe {
    fn probe(&self) -> HardwareReport {
        HardwareReport {
            has_accelerator: false,
            has_coprocessor: false,
            memory_mb: 8192,
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}
