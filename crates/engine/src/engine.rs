//! Engine root
//!
//! One `Engine` value owns the pool, caches, metrics and lifecycle; every
//! task borrows handles from it. There are no process-wide singletons.

use std::sync::Arc;

use lyra_config::Settings;
use lyra_core::{
    AudioFormat, BitDepth, Channels, G2p, HardwareProbe, SampleRate, SpeechError, Synthesizer,
    Utterance, UtteranceConfig,
};

use crate::g2p::{CharG2p, EnglishG2p};
use crate::lifecycle::LifecycleManager;
use crate::metrics::MetricsHub;
use crate::pool::SessionPool;
use crate::primer::PrimerCache;
use crate::scheduler::{Scheduler, UtteranceHandle};
use crate::segment::{Segmenter, SegmenterConfig};

/// Primer cache capacity; entries are sub-second PCM buffers
const PRIMER_CACHE_ENTRIES: usize = 64;

/// Backends the engine is assembled from
pub struct EngineBackends {
    pub accelerator: Arc<dyn Synthesizer>,
    pub coprocessor: Arc<dyn Synthesizer>,
    pub generic: Arc<dyn Synthesizer>,
    pub probe: Arc<dyn HardwareProbe>,
    /// `None` selects the built-in rule-based English G2P
    pub g2p: Option<Arc<dyn G2p>>,
}

/// An incoming synthesis request, pre-validation
#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
    pub lang: String,
    pub format: AudioFormat,
}

impl Default for SpeakRequest {
    fn default() -> Self {
        Self {
            text: String::new(),
            voice: "af_heart".to_string(),
            speed: 1.0,
            lang: "en-us".to_string(),
            format: AudioFormat::default(),
        }
    }
}

impl SpeakRequest {
    /// Validate against the documented API bounds
    pub fn validate(&self, settings: &Settings) -> Result<(), SpeechError> {
        let (min, max) = settings.speed_bounds();
        if !self.speed.is_finite() || self.speed < min || self.speed > max {
            return Err(SpeechError::InputInvalid(format!(
                "speed {} outside [{min}, {max}]",
                self.speed
            )));
        }
        if self.voice.is_empty() {
            return Err(SpeechError::InputInvalid("voice must be set".to_string()));
        }
        if let SampleRate::Other(hz) = self.format.sample_rate {
            tracing::warn!(rate = hz, "Unusual sample rate requested");
        }
        Ok(())
    }
}

/// The assembled engine
pub struct Engine {
    settings: Settings,
    segmenter: Segmenter,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<LifecycleManager>,
    metrics: Arc<MetricsHub>,
    pool: Arc<SessionPool>,
}

impl Engine {
    pub fn new(settings: Settings, backends: EngineBackends) -> Arc<Self> {
        let pool = Arc::new(SessionPool::new(
            backends.accelerator,
            backends.coprocessor,
            backends.generic,
            settings.pool.clone(),
        ));

        let (metrics, gate_rx) = MetricsHub::new(settings.slo.clone());
        let metrics = Arc::new(metrics);

        let g2p: Arc<dyn G2p> = backends
            .g2p
            .unwrap_or_else(|| Arc::new(EnglishG2p::default()));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&pool),
            g2p,
            Arc::new(CharG2p),
            Arc::new(PrimerCache::new(PRIMER_CACHE_ENTRIES)),
            Arc::clone(&metrics),
            gate_rx,
            settings.scheduler.clone(),
            settings.selector.clone(),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&pool),
            backends.probe,
            settings.lifecycle.clone(),
        ));

        let segmenter = Segmenter::new(SegmenterConfig {
            max_chars: settings.segmenter.max_chars,
            primer_threshold: settings.segmenter.primer_threshold,
        });

        Arc::new(Self {
            settings,
            segmenter,
            scheduler,
            lifecycle,
            metrics,
            pool,
        })
    }

    /// Warm up and declare ready
    pub async fn start(self: &Arc<Self>) -> Result<(), SpeechError> {
        self.lifecycle.start().await
    }

    pub fn ready(&self) -> bool {
        self.lifecycle.ready()
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    /// Accept a request and start streaming it
    pub fn speak(self: &Arc<Self>, request: SpeakRequest) -> Result<UtteranceHandle, SpeechError> {
        request.validate(&self.settings)?;
        self.lifecycle.note_request();

        let segments = self.segmenter.segment(&request.text);
        let config = UtteranceConfig {
            voice: request.voice,
            speed: request.speed,
            lang: request.lang,
            format: request.format,
            cross_fade_ms: self.settings.scheduler.cross_fade_ms,
        };

        tracing::info!(
            segments = segments.len(),
            chars = request.text.chars().count(),
            "Accepted synthesis request"
        );

        let utterance = Utterance::new(config, segments);
        Ok(self.scheduler.spawn(utterance))
    }

    pub fn metrics(&self) -> &Arc<MetricsHub> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The stream format for a request, defaulting anything unspecified
    pub fn default_format() -> AudioFormat {
        AudioFormat {
            sample_rate: SampleRate::Hz24000,
            channels: Channels::Mono,
            bit_depth: BitDepth::B16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::ToneSynthesizer;
    use lyra_core::GenericProbe;

    fn backends() -> EngineBackends {
        let s = || -> Arc<dyn Synthesizer> { Arc::new(ToneSynthesizer::new(24000)) };
        EngineBackends {
            accelerator: s(),
            coprocessor: s(),
            generic: s(),
            probe: Arc::new(GenericProbe),
            g2p: None,
        }
    }

    #[test]
    fn test_speed_bounds_rejected() {
        let settings = Settings::default();
        let mut request = SpeakRequest {
            text: "hi".into(),
            ..Default::default()
        };

        request.speed = 0.1;
        assert!(request.validate(&settings).is_err());
        request.speed = 5.0;
        assert!(request.validate(&settings).is_err());
        request.speed = f32::NAN;
        assert!(request.validate(&settings).is_err());
        request.speed = 1.0;
        assert!(request.validate(&settings).is_ok());
    }

    #[test]
    fn test_empty_voice_rejected() {
        let settings = Settings::default();
        let request = SpeakRequest {
            voice: String::new(),
            ..Default::default()
        };
        assert!(request.validate(&settings).is_err());
    }

    #[tokio::test]
    async fn test_engine_assembles_and_starts() {
        let engine = Engine::new(Settings::default(), backends());
        assert!(!engine.ready());
        engine.start().await.unwrap();
        assert!(engine.ready());
    }
}
