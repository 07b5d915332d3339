//! Synthesis scheduler
//!
//! Drives one utterance through a three-stage pipeline on cooperative
//! tasks: Stage A converts segment text to tokens (single-flight per
//! utterance), Stage B runs inference on pool sessions (two workers when
//! two non-CPU sessions are Ready, so segment n+1 precomputes while n
//! plays), Stage C reassembles in strict segment order, cross-fades seams,
//! slices into ~50 ms chunks and tags them through the sequencer.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use lyra_config::constants::stream::REORDER_WINDOW;
use lyra_config::{SchedulerSettings, SelectorSettings};
use lyra_core::{
    cross_fade, mono_to_stereo, resample, samples_to_pcm, Channels, Chunk, G2p, SampleRate,
    Segment, SpeechError, Style, Utterance, UtteranceConfig, UtteranceState,
};

use crate::metrics::{GateState, MetricsHub, UtteranceStats};
use crate::pool::{SessionKind, SessionPool};
use crate::primer::{PrimerCache, PrimerKey};
use crate::select::select;
use crate::sequencer::ChunkSequencer;

/// Events leaving the scheduler for one utterance
///
/// Chunks arrive in strict `seq` order. `Error` is the end-with-error
/// marker on the control channel; it always follows the final chunk.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Chunk),
    Error {
        segment_id: Option<u32>,
        message: String,
    },
    Finished {
        state: UtteranceState,
        stats: UtteranceStats,
    },
}

/// Handle to a running utterance
pub struct UtteranceHandle {
    pub id: Uuid,
    events: mpsc::Receiver<StreamEvent>,
    cancel_tx: watch::Sender<bool>,
}

impl UtteranceHandle {
    /// Next event in stream order; `None` after the stream closes
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Request cancellation; every stage observes it within one suspension
    /// point. In-flight inference finishes and its result is dropped.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// One synthesized segment heading into Stage C
struct SegmentPcm {
    samples: Vec<f32>,
    synth_wall: Duration,
}

struct WorkItem {
    segment: Segment,
    tokens: Vec<i64>,
}

/// The synthesis scheduler
pub struct Scheduler {
    pool: Arc<SessionPool>,
    g2p: Arc<dyn G2p>,
    g2p_fallback: Arc<dyn G2p>,
    primers: Arc<PrimerCache>,
    metrics: Arc<MetricsHub>,
    gate_rx: watch::Receiver<GateState>,
    config: SchedulerSettings,
    selector: SelectorSettings,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<SessionPool>,
        g2p: Arc<dyn G2p>,
        g2p_fallback: Arc<dyn G2p>,
        primers: Arc<PrimerCache>,
        metrics: Arc<MetricsHub>,
        gate_rx: watch::Receiver<GateState>,
        config: SchedulerSettings,
        selector: SelectorSettings,
    ) -> Self {
        Self {
            pool,
            g2p,
            g2p_fallback,
            primers,
            metrics,
            gate_rx,
            config,
            selector,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Launch an utterance; chunks and control events arrive on the handle
    pub fn spawn(self: &Arc<Self>, utterance: Utterance) -> UtteranceHandle {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = utterance.id;

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drive(utterance, event_tx, cancel_rx).await;
        });

        UtteranceHandle {
            id,
            events: event_rx,
            cancel_tx,
        }
    }

    async fn drive(
        self: Arc<Self>,
        utterance: Utterance,
        event_tx: mpsc::Sender<StreamEvent>,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let mut timer = self.metrics.begin();
        let config = utterance.config.clone();
        let format = config.format;
        let mut sequencer = ChunkSequencer::new(format);

        // Envelope: header + silence primer leave before any inference
        for chunk in sequencer.start() {
            timer.mark_chunk(false);
            if event_tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                return;
            }
        }

        if utterance.is_empty() {
            if let Some(marker) = sequencer.finish() {
                timer.mark_chunk(false);
                let _ = event_tx.send(StreamEvent::Chunk(marker)).await;
            }
            let stats = timer.finish(0);
            self.metrics.record(&stats);
            let _ = event_tx
                .send(StreamEvent::Finished {
                    state: UtteranceState::Completed,
                    stats,
                })
                .await;
            return;
        }

        let segments = utterance.segments.clone();
        let total = segments.len() as u32;

        // Dual-session prefetch only helps when two non-CPU sessions are
        // warm and the SLO gate has not pulled it
        let gate = *self.gate_rx.borrow();
        let workers = if self.config.dual_session_prefetch
            && gate.prefetch_enabled
            && self.pool.snapshot().ready_non_generic() >= 2
        {
            2
        } else {
            1
        };

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(workers + 1);
        let (done_tx, mut done_rx) =
            mpsc::channel::<(u32, Result<SegmentPcm, SpeechError>)>(workers + 2);
        let prev_kind: Arc<Mutex<Option<SessionKind>>> = Arc::new(Mutex::new(None));

        // Egress progress watermark: the first unemitted segment id. Stage B
        // holds any segment past `watermark + REORDER_WINDOW`, so one worker
        // runs segment n while the other prefetches at most n+1, and Stage C
        // buffers at most one future segment.
        let (progress_tx, progress_rx) = watch::channel(0u32);

        // Stage A: single-flight text -> tokens, primer fast path
        let stage_a = {
            let scheduler = Arc::clone(&self);
            let config = config.clone();
            let cancel = cancel_rx.clone();
            let done_tx = done_tx.clone();
            let prev_kind = Arc::clone(&prev_kind);
            tokio::spawn(async move {
                for segment in segments {
                    if *cancel.borrow() {
                        break;
                    }
                    if segment.is_primer {
                        let result = scheduler
                            .primer_pcm(&segment, &config, &prev_kind)
                            .await
                            .map(|(samples, synth_wall)| SegmentPcm {
                                samples,
                                synth_wall,
                            });
                        if done_tx.send((segment.id, result)).await.is_err() {
                            return;
                        }
                        continue;
                    }

                    match scheduler.tokens_for(&segment, &config.lang).await {
                        Ok(tokens) => {
                            if work_tx.send(WorkItem { segment, tokens }).await.is_err() {
                                return;
                            }
                        },
                        Err(e) => {
                            let _ = done_tx.send((segment.id, Err(e))).await;
                            return;
                        },
                    }
                }
            })
        };

        // Stage B: inference workers pulling from the shared queue
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let mut stage_b = Vec::new();
        for worker in 0..workers {
            let scheduler = Arc::clone(&self);
            let config = config.clone();
            let mut cancel = cancel_rx.clone();
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            let prev_kind = Arc::clone(&prev_kind);
            let mut progress = progress_rx.clone();
            stage_b.push(tokio::spawn(async move {
                let window = REORDER_WINDOW as u32;
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    let Some(item) = item else { break };

                    // Hold prefetch to the reorder window: inference on a
                    // segment starts only once it is within REORDER_WINDOW
                    // of the first unemitted segment
                    let held_back = loop {
                        if *cancel.borrow() {
                            break true;
                        }
                        if item.segment.id <= *progress.borrow() + window {
                            break false;
                        }
                        tokio::select! {
                            biased;
                            changed = cancel.changed() => {
                                if changed.is_err() {
                                    break true;
                                }
                            },
                            changed = progress.changed() => {
                                if changed.is_err() {
                                    break true;
                                }
                            },
                        }
                    };
                    if held_back {
                        break;
                    }

                    let result = scheduler
                        .synth_segment(&item.segment, &item.tokens, &config, &prev_kind)
                        .await;

                    // Cancellation acknowledged by dropping the result, not
                    // by aborting the native call
                    if *cancel.borrow() {
                        break;
                    }
                    let result = result.map(|(samples, synth_wall)| SegmentPcm {
                        samples,
                        synth_wall,
                    });
                    if done_tx.send((item.segment.id, result)).await.is_err() {
                        break;
                    }
                }
                tracing::trace!(worker, "Stage B worker done");
            }));
        }
        drop(done_tx);

        // Stage C: strict-order reassembly, cross-fade, chunking
        let outcome = self
            .egress(
                &mut sequencer,
                &mut timer,
                &config,
                total,
                gate.widen_prebuffer,
                &mut done_rx,
                cancel_rx.clone(),
                &event_tx,
                &progress_tx,
            )
            .await;

        stage_a.abort();
        for worker in stage_b {
            worker.abort();
        }

        let state = match &outcome {
            EgressOutcome::Completed => UtteranceState::Completed,
            EgressOutcome::Cancelled => UtteranceState::Cancelled,
            EgressOutcome::Failed { .. } => UtteranceState::Failed,
            EgressOutcome::Disconnected => return,
        };

        // Terminate the chunk stream before any error marker
        if let Some(marker) = sequencer.finish() {
            timer.mark_chunk(false);
            let _ = event_tx.send(StreamEvent::Chunk(marker)).await;
        }

        if let EgressOutcome::Failed {
            segment_id,
            message,
        } = &outcome
        {
            let _ = event_tx
                .send(StreamEvent::Error {
                    segment_id: *segment_id,
                    message: message.clone(),
                })
                .await;
        }

        let stats = timer.finish(0);
        if state == UtteranceState::Completed {
            self.metrics.record(&stats);
        }
        let _ = event_tx
            .send(StreamEvent::Finished { state, stats })
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn egress(
        &self,
        sequencer: &mut ChunkSequencer,
        timer: &mut crate::metrics::UtteranceTimer,
        config: &UtteranceConfig,
        total: u32,
        widen_prebuffer: bool,
        done_rx: &mut mpsc::Receiver<(u32, Result<SegmentPcm, SpeechError>)>,
        mut cancel_rx: watch::Receiver<bool>,
        event_tx: &mpsc::Sender<StreamEvent>,
        progress_tx: &watch::Sender<u32>,
    ) -> EgressOutcome {
        let format = config.format;
        let fade_samples = if config.cross_fade_ms == 0 {
            0
        } else {
            format.sample_rate.samples_for_ms(config.cross_fade_ms)
        };

        // Inference may complete out of order; the window holds an early
        // segment until its predecessor has fully left. Stage B's watermark
        // hold bounds this at REORDER_WINDOW future segments.
        let mut pending: BTreeMap<u32, SegmentPcm> = BTreeMap::new();
        let mut next_id: u32 = 0;
        let mut tail_hold: Vec<f32> = Vec::new();

        // Degraded mode trades TTFA for cadence: hold the first emission
        // until a second segment is buffered behind it
        let mut warm_hold = widen_prebuffer && total > 1;

        while next_id < total {
            let received = tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        return EgressOutcome::Cancelled;
                    }
                    continue;
                }
                r = done_rx.recv() => r,
            };

            let Some((segment_id, outcome)) = received else {
                return EgressOutcome::Failed {
                    segment_id: Some(next_id),
                    message: "pipeline stages ended early".to_string(),
                };
            };

            match outcome {
                Ok(pcm) => {
                    pending.insert(segment_id, pcm);
                },
                Err(e) => {
                    tracing::error!(segment_id, error = %e, "Segment failed; failing utterance");
                    return EgressOutcome::Failed {
                        segment_id: Some(segment_id),
                        message: e.to_string(),
                    };
                },
            }

            if warm_hold {
                let second_buffered = pending.contains_key(&0) && pending.contains_key(&1);
                let tail_arrived = pending.contains_key(&(total - 1));
                if second_buffered || tail_arrived {
                    warm_hold = false;
                } else {
                    continue;
                }
            }

            while let Some(pcm) = pending.remove(&next_id) {
                if *cancel_rx.borrow() {
                    return EgressOutcome::Cancelled;
                }
                let audio = Duration::from_secs_f64(
                    pcm.samples.len() as f64 / format.sample_rate.as_u32() as f64,
                );
                timer.add_synthesis(pcm.synth_wall, audio);

                let is_last_segment = next_id + 1 == total;
                if !self
                    .emit_segment(
                        sequencer,
                        timer,
                        event_tx,
                        next_id,
                        pcm.samples,
                        &mut tail_hold,
                        fade_samples,
                        is_last_segment,
                        config,
                    )
                    .await
                {
                    return EgressOutcome::Disconnected;
                }
                next_id += 1;
                // Advance the watermark so Stage B may start the next
                // prefetch
                let _ = progress_tx.send(next_id);
            }
        }

        EgressOutcome::Completed
    }

    /// Cross-fade against the held tail, slice into chunks, send
    ///
    /// Returns false when the receiver is gone.
    #[allow(clippy::too_many_arguments)]
    async fn emit_segment(
        &self,
        sequencer: &mut ChunkSequencer,
        timer: &mut crate::metrics::UtteranceTimer,
        event_tx: &mpsc::Sender<StreamEvent>,
        segment_id: u32,
        samples: Vec<f32>,
        tail_hold: &mut Vec<f32>,
        fade_samples: usize,
        is_last_segment: bool,
        config: &UtteranceConfig,
    ) -> bool {
        let format = config.format;

        let merged = if tail_hold.is_empty() {
            samples
        } else {
            let head = std::mem::take(tail_hold);
            cross_fade(&head, &samples, fade_samples)
        };

        // Hold the seam back so the next segment can blend into it
        let (to_emit, hold) = if !is_last_segment && fade_samples > 0 && merged.len() > fade_samples
        {
            let cut = merged.len() - fade_samples;
            (merged[..cut].to_vec(), merged[cut..].to_vec())
        } else {
            (merged, Vec::new())
        };
        *tail_hold = hold;

        let chunk_samples = format.sample_rate.samples_for_ms(self.config.chunk_ms).max(1);
        let slices: Vec<&[f32]> = to_emit.chunks(chunk_samples).collect();
        let n = slices.len();

        for (i, slice) in slices.into_iter().enumerate() {
            let expanded;
            let channel_samples: &[f32] = match format.channels {
                Channels::Mono => slice,
                Channels::Stereo => {
                    expanded = mono_to_stereo(slice);
                    &expanded
                },
            };
            let bytes = samples_to_pcm(channel_samples, format.bit_depth);
            let last_of_segment = i + 1 == n;
            let last_of_utterance = last_of_segment && is_last_segment;

            match sequencer.tag(segment_id, bytes, last_of_segment, last_of_utterance) {
                Ok(chunk) => {
                    timer.mark_chunk(true);
                    if event_tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                        return false;
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "Sequencer rejected chunk");
                    return false;
                },
            }
        }

        // A fully held-back segment (shorter than the fade) still needs its
        // boundary flags on the next emission; that case degenerates to the
        // last segment carrying them
        if n == 0 && is_last_segment {
            if let Ok(chunk) = sequencer.tag(segment_id, Vec::new(), true, true) {
                timer.mark_chunk(true);
                if event_tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                    return false;
                }
            }
        }

        true
    }

    /// Text to tokens with one character-level retry
    async fn tokens_for(&self, segment: &Segment, lang: &str) -> Result<Vec<i64>, SpeechError> {
        match self.g2p.to_tokens(&segment.text, lang).await {
            Ok(tokens) => Ok(tokens),
            Err(first) => {
                tracing::warn!(
                    segment_id = segment.id,
                    error = %first,
                    "G2P failed; retrying with character-level fallback"
                );
                self.g2p_fallback
                    .to_tokens(&segment.text, lang)
                    .await
                    .map_err(|e| SpeechError::G2pFailed(format!("{first}; fallback: {e}")))
            },
        }
    }

    /// Primer fast path: serve segment 0 from the cache, building through
    /// the normal pipeline on a miss
    async fn primer_pcm(
        &self,
        segment: &Segment,
        config: &UtteranceConfig,
        prev_kind: &Arc<Mutex<Option<SessionKind>>>,
    ) -> Result<(Vec<f32>, Duration), SpeechError> {
        let key = PrimerKey::new(&segment.text, &config.voice, config.speed, &config.lang);

        if let Some(samples) = self.primers.get(key) {
            tracing::debug!(segment_id = segment.id, "Primer cache hit");
            return Ok((samples.as_ref().clone(), Duration::ZERO));
        }

        let started = Instant::now();
        let samples = self
            .primers
            .get_or_build(key, || async {
                let tokens = self.tokens_for(segment, &config.lang).await?;
                let (samples, _wall) = self
                    .synth_segment(segment, &tokens, config, prev_kind)
                    .await?;
                Ok(samples)
            })
            .await?;
        Ok((samples.as_ref().clone(), started.elapsed()))
    }

    /// Stage B core: select, acquire, synthesize, with one retry on the
    /// next preferred session
    async fn synth_segment(
        &self,
        segment: &Segment,
        tokens: &[i64],
        config: &UtteranceConfig,
        prev_kind: &Arc<Mutex<Option<SessionKind>>>,
    ) -> Result<(Vec<f32>, Duration), SpeechError> {
        let style = Style {
            voice: config.voice.clone(),
            lang: config.lang.clone(),
        };
        let mut last_err: Option<SpeechError> = None;

        for attempt in 0..2 {
            let snapshot = self.pool.snapshot();
            let prev = if attempt == 0 { *prev_kind.lock() } else { None };
            let Some(kind) = select(segment.char_len, &snapshot, prev, &self.selector) else {
                return Err(SpeechError::SessionUnavailable);
            };

            let guard = match self.pool.acquire(kind).await {
                Ok(g) => g,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                },
            };

            let started = Instant::now();
            let result = guard.synthesize(tokens, &style, config.speed).await;
            let elapsed = started.elapsed();
            let synth_rate = guard.sample_rate();
            drop(guard);

            match result {
                Ok(samples) => {
                    self.pool.record_success(kind);
                    *prev_kind.lock() = Some(kind);

                    // A slow synthesis is a degradation signal, never an
                    // interrupt; it only keeps the next segment off this
                    // session
                    let audio =
                        Duration::from_secs_f64(samples.len() as f64 / synth_rate as f64);
                    let deadline = audio.mul_f64(self.config.deadline_factor);
                    if !audio.is_zero() && elapsed > deadline {
                        self.pool.mark_degraded(kind, "inference exceeded deadline");
                    }

                    if self.pool.needs_cleanup(kind) {
                        let pool = Arc::clone(&self.pool);
                        tokio::spawn(async move {
                            if let Err(e) = pool.scoped_cleanup(kind).await {
                                tracing::warn!(session = kind.label(), error = %e, "Scoped cleanup failed");
                            }
                        });
                    }

                    let target = config.format.sample_rate;
                    let samples = if synth_rate != target.as_u32() {
                        resample(&samples, SampleRate::from_hz(synth_rate), target)
                    } else {
                        samples
                    };
                    return Ok((samples, elapsed));
                },
                Err(e) => {
                    let state = self.pool.record_failure(kind);
                    tracing::warn!(
                        segment_id = segment.id,
                        session = kind.label(),
                        attempt,
                        state = ?state,
                        error = %e,
                        "Inference failed"
                    );
                    last_err = Some(e);
                },
            }
        }

        Err(SpeechError::SynthesisFailed {
            segment_id: segment.id,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

enum EgressOutcome {
    Completed,
    Cancelled,
    Failed {
        segment_id: Option<u32>,
        message: String,
    },
    /// Receiver dropped; nobody is listening
    Disconnected,
}
