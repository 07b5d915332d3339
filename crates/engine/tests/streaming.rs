//! End-to-end pipeline tests against deterministic backends

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use lyra_config::Settings;
use lyra_core::{
    AudioFormat, Chunk, GenericProbe, SpeechError, Style, Synthesizer, UtteranceState,
};
use lyra_engine::{
    Engine, EngineBackends, FlakySynthesizer, SessionKind, SessionState, SpeakRequest,
    StreamEvent, ToneSynthesizer,
};

/// Tone backend with an artificial per-call delay, for cancellation tests
struct SlowSynthesizer {
    inner: ToneSynthesizer,
    delay: Duration,
}

/// Tone backend whose first call blocks until released; counts call starts
struct HoldFirstSynthesizer {
    inner: ToneSynthesizer,
    calls: Arc<AtomicU32>,
    release: watch::Receiver<bool>,
}

#[async_trait]
impl Synthesizer for HoldFirstSynthesizer {
    async fn synthesize(
        &self,
        tokens: &[i64],
        style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            let mut release = self.release.clone();
            while !*release.borrow() {
                if release.changed().await.is_err() {
                    break;
                }
            }
        }
        self.inner.synthesize(tokens, style, speed).await
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }
}

#[async_trait]
impl Synthesizer for SlowSynthesizer {
    async fn synthesize(
        &self,
        tokens: &[i64],
        style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        tokio::time::sleep(self.delay).await;
        self.inner.synthesize(tokens, style, speed).await
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }
}

fn tone_backends() -> EngineBackends {
    let s = || -> Arc<dyn Synthesizer> { Arc::new(ToneSynthesizer::new(24000)) };
    EngineBackends {
        accelerator: s(),
        coprocessor: s(),
        generic: s(),
        probe: Arc::new(GenericProbe),
        g2p: None,
    }
}

async fn started_engine(backends: EngineBackends) -> Arc<Engine> {
    let mut settings = Settings::default();
    settings.lifecycle.keep_alive_enabled = false;
    settings.lifecycle.minimal_warmup = false;
    settings.lifecycle.defer_background_init = false;
    let engine = Engine::new(settings, backends);
    engine.start().await.unwrap();
    engine
}

/// Engine with warmup skipped entirely; failure-injection backends would
/// otherwise eat their scripted failures during the warm inference
async fn started_engine_cold(backends: EngineBackends) -> Arc<Engine> {
    let mut settings = Settings::default();
    settings.lifecycle.keep_alive_enabled = false;
    settings.lifecycle.enable_cold_start_warmup = false;
    settings.lifecycle.defer_background_init = false;
    let engine = Engine::new(settings, backends);
    engine.start().await.unwrap();
    engine
}

struct Collected {
    chunks: Vec<Chunk>,
    errors: Vec<String>,
    finishes: Vec<UtteranceState>,
    ttfa_ms: Option<u64>,
}

async fn collect(engine: &Arc<Engine>, request: SpeakRequest) -> Collected {
    let mut handle = engine.speak(request).unwrap();
    let mut out = Collected {
        chunks: Vec::new(),
        errors: Vec::new(),
        finishes: Vec::new(),
        ttfa_ms: None,
    };
    while let Some(event) = handle.next().await {
        match event {
            StreamEvent::Chunk(c) => out.chunks.push(c),
            StreamEvent::Error { message, .. } => out.errors.push(message),
            StreamEvent::Finished { state, stats } => {
                out.finishes.push(state);
                out.ttfa_ms = Some(stats.ttfa_ms);
            },
        }
    }
    out
}

fn request(text: &str) -> SpeakRequest {
    SpeakRequest {
        text: text.to_string(),
        voice: "af_heart".to_string(),
        speed: 1.0,
        lang: "en-us".to_string(),
        format: AudioFormat::default(),
    }
}

fn payload_bytes(chunks: &[Chunk]) -> Vec<u8> {
    // Skip header (seq 0) and silence primer (seq 1)
    chunks
        .iter()
        .filter(|c| c.seq >= 2)
        .flat_map(|c| c.bytes.iter().copied())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn short_greeting_warm() {
    let engine = started_engine(tone_backends()).await;
    let out = collect(&engine, request("Hello, world.")).await;

    // One Finished event, state Completed; completion is exactly-once
    assert_eq!(out.finishes, vec![UtteranceState::Completed]);
    assert!(out.errors.is_empty());

    // Envelope then payload, strictly ordered
    assert_eq!(&out.chunks[0].bytes[0..4], b"RIFF");
    for window in out.chunks.windows(2) {
        assert_eq!(window[1].seq, window[0].seq + 1);
    }

    // Single primer segment
    assert!(out.chunks.iter().all(|c| c.segment_id == 0));
    assert_eq!(
        out.chunks.iter().filter(|c| c.is_last_of_utterance).count(),
        1
    );

    // Warm path beats the TTFA target comfortably
    assert!(out.ttfa_ms.unwrap() < 500);
    assert!(!payload_bytes(&out.chunks).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_text_completes_with_envelope_only() {
    let engine = started_engine(tone_backends()).await;
    let out = collect(&engine, request("")).await;

    assert_eq!(out.finishes, vec![UtteranceState::Completed]);
    // Header, silence, end marker
    assert_eq!(out.chunks.len(), 3);
    assert!(out.chunks[2].is_last_of_utterance);
    assert!(out.chunks[2].bytes.is_empty());
    assert!(payload_bytes(&out.chunks)[..].iter().all(|&b| b == 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_character_is_one_primer_stream() {
    let engine = started_engine(tone_backends()).await;
    let out = collect(&engine, request("a")).await;

    assert_eq!(out.finishes, vec![UtteranceState::Completed]);
    assert!(out.chunks.iter().all(|c| c.segment_id == 0));
    assert!(!payload_bytes(&out.chunks).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cap_boundary_single_segment() {
    let engine = started_engine(tone_backends()).await;
    let text = "x".repeat(1800);
    let out = collect(&engine, request(&text)).await;

    assert_eq!(out.finishes, vec![UtteranceState::Completed]);
    // No hard slice: one segment end to end
    assert!(out.chunks.iter().all(|c| c.segment_id == 0));
    assert_eq!(out.chunks.iter().filter(|c| c.is_last_of_segment).count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_paragraphs_ordered_delivery() {
    let engine = started_engine(tone_backends()).await;
    let out = collect(&engine, request("Para one.\n\nPara two.")).await;

    assert_eq!(out.finishes, vec![UtteranceState::Completed]);

    let max_segment = out.chunks.iter().map(|c| c.segment_id).max().unwrap();
    assert_eq!(max_segment, 1);

    // Egress order is segment 0 fully before segment 1
    let first_of_1 = out.chunks.iter().position(|c| c.segment_id == 1).unwrap();
    assert!(out.chunks[..first_of_1]
        .iter()
        .all(|c| c.segment_id == 0));

    // Chunk sequence strictly monotonic across the seam
    for window in out.chunks.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streamed_bytes_are_deterministic() {
    let engine = started_engine(tone_backends()).await;

    let a = collect(&engine, request("Same words, same bytes.")).await;
    let b = collect(&engine, request("Same words, same bytes.")).await;

    assert_eq!(payload_bytes(&a.chunks), payload_bytes(&b.chunks));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_stream() {
    let slow = || -> Arc<dyn Synthesizer> {
        Arc::new(SlowSynthesizer {
            inner: ToneSynthesizer::new(24000),
            delay: Duration::from_millis(150),
        })
    };
    let backends = EngineBackends {
        accelerator: slow(),
        coprocessor: slow(),
        generic: slow(),
        probe: Arc::new(GenericProbe),
        g2p: None,
    };
    let engine = started_engine(backends).await;

    let text = vec!["A paragraph that runs on for a while."; 5].join("\n\n");
    let mut handle = engine.speak(request(&text)).unwrap();

    // Read the envelope, then cancel while Stage B is mid-inference
    let mut seen = 0;
    while seen < 2 {
        match handle.next().await {
            Some(StreamEvent::Chunk(_)) => seen += 1,
            Some(_) => {},
            None => panic!("stream ended before envelope"),
        }
    }
    handle.cancel();

    let mut finish = None;
    let mut error_seen = false;
    while let Some(event) = handle.next().await {
        match event {
            StreamEvent::Finished { state, .. } => finish = Some(state),
            StreamEvent::Error { .. } => error_seen = true,
            StreamEvent::Chunk(_) => {},
        }
    }

    // Cancellation is not an error and does not complete the utterance
    assert_eq!(finish, Some(UtteranceState::Cancelled));
    assert!(!error_seen);
}

#[tokio::test(flavor = "multi_thread")]
async fn accelerator_failure_falls_back_and_completes() {
    let backends = EngineBackends {
        accelerator: Arc::new(FlakySynthesizer::failing_times(2, 24000)),
        coprocessor: Arc::new(ToneSynthesizer::new(24000)),
        generic: Arc::new(ToneSynthesizer::new(24000)),
        probe: Arc::new(GenericProbe),
        g2p: None,
    };
    let engine = started_engine_cold(backends).await;

    // Short input routes to the accelerator first
    let out = collect(&engine, request("Hi there.")).await;

    assert_eq!(out.finishes, vec![UtteranceState::Completed]);
    assert!(out.errors.is_empty());
    assert!(!payload_bytes(&out.chunks).is_empty());

    // The accelerator wears the failure; the fallback session is untouched
    assert_eq!(
        engine.pool().state(SessionKind::Accelerator),
        SessionState::Degraded
    );
    assert_eq!(
        engine.pool().state(SessionKind::Generic),
        SessionState::Ready
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn all_sessions_failing_fails_utterance_with_error_marker() {
    let flaky = || -> Arc<dyn Synthesizer> { Arc::new(FlakySynthesizer::failing_times(100, 24000)) };
    let backends = EngineBackends {
        accelerator: flaky(),
        coprocessor: flaky(),
        generic: flaky(),
        probe: Arc::new(GenericProbe),
        g2p: None,
    };
    let engine = started_engine_cold(backends).await;

    let out = collect(&engine, request("This will not synthesize.")).await;

    assert_eq!(out.finishes, vec![UtteranceState::Failed]);
    assert_eq!(out.errors.len(), 1);
    // The stream still terminates with a marked final chunk
    assert_eq!(
        out.chunks.iter().filter(|c| c.is_last_of_utterance).count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn prefetch_stays_within_reorder_window() {
    // Five short paragraphs, segment 0 stuck in inference. The prefetch
    // worker may start segment 1; segments 2..4 must wait until 0 is
    // emitted, so at most two synth calls begin while 0 is held.
    let calls = Arc::new(AtomicU32::new(0));
    let (release_tx, release_rx) = watch::channel(false);
    let synth: Arc<dyn Synthesizer> = Arc::new(HoldFirstSynthesizer {
        inner: ToneSynthesizer::new(24000),
        calls: Arc::clone(&calls),
        release: release_rx,
    });
    let backends = EngineBackends {
        accelerator: Arc::clone(&synth),
        coprocessor: Arc::clone(&synth),
        generic: Arc::clone(&synth),
        probe: Arc::new(GenericProbe),
        g2p: None,
    };
    // Cold start: a warm inference would consume the blocked first call
    let engine = started_engine_cold(backends).await;

    let text = vec!["A paragraph that stands alone."; 5].join("\n\n");
    let mut handle = engine.speak(request(&text)).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        calls.load(Ordering::SeqCst) <= 2,
        "prefetch ran past the reorder window: {} calls started",
        calls.load(Ordering::SeqCst)
    );

    release_tx.send(true).unwrap();

    let mut finish = None;
    let mut chunks = Vec::new();
    while let Some(event) = handle.next().await {
        match event {
            StreamEvent::Chunk(c) => chunks.push(c),
            StreamEvent::Finished { state, .. } => finish = Some(state),
            StreamEvent::Error { .. } => {},
        }
    }

    assert_eq!(finish, Some(UtteranceState::Completed));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    for window in chunks.windows(2) {
        assert!(window[1].segment_id >= window[0].segment_id);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn long_text_uses_multiple_segments_in_order() {
    let engine = started_engine(tone_backends()).await;
    let text = "This sentence repeats to build length. ".repeat(120);
    let out = collect(&engine, request(&text)).await;

    assert_eq!(out.finishes, vec![UtteranceState::Completed]);

    let max_segment = out.chunks.iter().map(|c| c.segment_id).max().unwrap();
    assert!(max_segment >= 1);

    // Segment ids non-decreasing at egress despite prefetch
    for window in out.chunks.windows(2) {
        assert!(window[1].segment_id >= window[0].segment_id);
    }

    // Exactly one end-of-utterance marker
    assert_eq!(
        out.chunks.iter().filter(|c| c.is_last_of_utterance).count(),
        1
    );
}
