//! Per-request metrics and SLO gates
//!
//! TTFA has exactly one measurement point: request accept to the first
//! payload chunk leaving the sequencer. Sliding-window aggregates feed two
//! advisory gates: Degrade (disable dual-session prefetch, widen the
//! pre-buffer) and Restore. Gates never terminate in-flight work.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use lyra_config::SloSettings;

/// Finished-utterance statistics
#[derive(Debug, Clone, Default)]
pub struct UtteranceStats {
    pub ttfa_ms: u64,
    /// Synthesis wall time over produced audio duration; < 1.0 beats real time
    pub rtf: f64,
    pub p95_gap_ms: u64,
    pub underruns: u32,
    pub chunks: u64,
    pub audio_duration: Duration,
    /// Resident-memory growth over the utterance, when a probe reported it
    pub memory_delta_mb: i64,
}

/// Advisory gate state consumed by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateState {
    pub prefetch_enabled: bool,
    pub widen_prebuffer: bool,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            prefetch_enabled: true,
            widen_prebuffer: false,
        }
    }
}

/// Per-utterance stopwatch handed out at request accept
pub struct UtteranceTimer {
    accepted: Instant,
    first_payload: Option<Instant>,
    last_chunk: Option<Instant>,
    gaps_ms: Vec<u64>,
    synth_wall: Duration,
    audio: Duration,
    chunks: u64,
    memory_delta_mb: i64,
}

impl UtteranceTimer {
    fn new() -> Self {
        Self {
            accepted: Instant::now(),
            first_payload: None,
            last_chunk: None,
            gaps_ms: Vec::new(),
            synth_wall: Duration::ZERO,
            audio: Duration::ZERO,
            chunks: 0,
            memory_delta_mb: 0,
        }
    }

    /// Called once per chunk leaving the sequencer; envelope chunks pass
    /// `payload = false` and do not start the TTFA clock
    pub fn mark_chunk(&mut self, payload: bool) {
        let now = Instant::now();
        if payload && self.first_payload.is_none() {
            self.first_payload = Some(now);
        }
        if let Some(last) = self.last_chunk {
            self.gaps_ms.push(now.duration_since(last).as_millis() as u64);
        }
        self.last_chunk = Some(now);
        self.chunks += 1;
    }

    pub fn add_synthesis(&mut self, wall: Duration, audio: Duration) {
        self.synth_wall += wall;
        self.audio += audio;
    }

    pub fn note_memory_delta(&mut self, delta_mb: i64) {
        self.memory_delta_mb = delta_mb;
    }

    pub fn ttfa(&self) -> Option<Duration> {
        self.first_payload.map(|t| t.duration_since(self.accepted))
    }

    pub fn finish(self, underruns: u32) -> UtteranceStats {
        let ttfa_ms = self
            .ttfa()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let rtf = if self.audio > Duration::ZERO {
            self.synth_wall.as_secs_f64() / self.audio.as_secs_f64()
        } else {
            0.0
        };

        UtteranceStats {
            ttfa_ms,
            rtf,
            p95_gap_ms: percentile(&self.gaps_ms, 0.95),
            underruns,
            chunks: self.chunks,
            audio_duration: self.audio,
            memory_delta_mb: self.memory_delta_mb,
        }
    }
}

struct HubState {
    recent_ttfa: VecDeque<u64>,
    degraded: bool,
    healthy_streak: usize,
}

/// Metrics hub: records per-utterance stats, exports facade counters, and
/// drives the SLO gates
pub struct MetricsHub {
    config: SloSettings,
    state: Mutex<HubState>,
    gate_tx: watch::Sender<GateState>,
}

impl MetricsHub {
    pub fn new(config: SloSettings) -> (Self, watch::Receiver<GateState>) {
        let (gate_tx, gate_rx) = watch::channel(GateState::default());
        let hub = Self {
            config,
            state: Mutex::new(HubState {
                recent_ttfa: VecDeque::new(),
                degraded: false,
                healthy_streak: 0,
            }),
            gate_tx,
        };
        (hub, gate_rx)
    }

    /// Start the stopwatch for a just-accepted request
    pub fn begin(&self) -> UtteranceTimer {
        metrics::counter!("lyra_utterances_total").increment(1);
        UtteranceTimer::new()
    }

    /// Record a finished utterance and reevaluate the gates
    pub fn record(&self, stats: &UtteranceStats) {
        metrics::histogram!("lyra_ttfa_ms").record(stats.ttfa_ms as f64);
        metrics::histogram!("lyra_rtf").record(stats.rtf);
        metrics::histogram!("lyra_interchunk_gap_p95_ms").record(stats.p95_gap_ms as f64);
        if stats.underruns > 0 {
            metrics::counter!("lyra_underruns_total").increment(stats.underruns as u64);
        }

        let mut state = self.state.lock();
        state.recent_ttfa.push_back(stats.ttfa_ms);
        while state.recent_ttfa.len() > self.config.window {
            state.recent_ttfa.pop_front();
        }

        let target = self.config.ttfa_target_ms as f64;
        let trip = target * self.config.degrade_factor;

        if !state.degraded {
            if state.recent_ttfa.len() >= self.config.window {
                let ttfa: Vec<u64> = state.recent_ttfa.iter().copied().collect();
                let p95 = percentile(&ttfa, 0.95) as f64;
                if p95 >= trip {
                    state.degraded = true;
                    state.healthy_streak = 0;
                    tracing::warn!(
                        p95_ttfa_ms = p95,
                        target_ms = target,
                        "SLO gate: degrading (prefetch off, pre-buffer widened)"
                    );
                    metrics::counter!("lyra_slo_degrades_total").increment(1);
                    let _ = self.gate_tx.send(GateState {
                        prefetch_enabled: false,
                        widen_prebuffer: true,
                    });
                }
            }
        } else {
            if (stats.ttfa_ms as f64) < target {
                state.healthy_streak += 1;
            } else {
                state.healthy_streak = 0;
            }
            if state.healthy_streak >= self.config.window {
                state.degraded = false;
                state.healthy_streak = 0;
                tracing::info!("SLO gate: restored");
                metrics::counter!("lyra_slo_restores_total").increment(1);
                let _ = self.gate_tx.send(GateState::default());
            }
        }
    }

    pub fn gate(&self) -> GateState {
        *self.gate_tx.borrow()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }
}

fn percentile(values: &[u64], q: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> (MetricsHub, watch::Receiver<GateState>) {
        MetricsHub::new(SloSettings {
            window: 4,
            ttfa_target_ms: 500,
            degrade_factor: 2.0,
        })
    }

    fn stats(ttfa_ms: u64) -> UtteranceStats {
        UtteranceStats {
            ttfa_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 0.95), 0);
        assert_eq!(percentile(&[5], 0.95), 5);
        let values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&values, 0.95), 94);
    }

    #[test]
    fn test_timer_ttfa_starts_at_first_payload_chunk() {
        let mut timer = UtteranceTimer::new();
        // Envelope chunks leave immediately; they must not stop the clock
        timer.mark_chunk(false);
        timer.mark_chunk(false);
        assert!(timer.ttfa().is_none());

        std::thread::sleep(Duration::from_millis(5));
        timer.mark_chunk(true);
        assert!(timer.ttfa().unwrap() >= Duration::from_millis(5));
    }

    #[test]
    fn test_rtf_is_wall_over_audio() {
        let mut timer = UtteranceTimer::new();
        timer.add_synthesis(Duration::from_millis(500), Duration::from_secs(1));
        let stats = timer.finish(0);
        assert!((stats.rtf - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_gate_degrades_after_window_of_slow_ttfa() {
        let (hub, gate_rx) = hub();
        for _ in 0..4 {
            hub.record(&stats(1500));
        }
        assert!(hub.is_degraded());
        let gate = *gate_rx.borrow();
        assert!(!gate.prefetch_enabled);
        assert!(gate.widen_prebuffer);
    }

    #[test]
    fn test_gate_needs_full_window_before_tripping() {
        let (hub, _rx) = hub();
        for _ in 0..3 {
            hub.record(&stats(5000));
        }
        assert!(!hub.is_degraded());
    }

    #[test]
    fn test_gate_restores_after_consecutive_healthy_window() {
        let (hub, gate_rx) = hub();
        for _ in 0..4 {
            hub.record(&stats(1500));
        }
        assert!(hub.is_degraded());

        for _ in 0..4 {
            hub.record(&stats(200));
        }
        assert!(!hub.is_degraded());
        assert!(gate_rx.borrow().prefetch_enabled);
    }

    #[test]
    fn test_restore_streak_resets_on_slow_utterance() {
        let (hub, _rx) = hub();
        for _ in 0..4 {
            hub.record(&stats(1500));
        }
        hub.record(&stats(100));
        hub.record(&stats(100));
        hub.record(&stats(2000)); // resets the streak
        hub.record(&stats(100));
        hub.record(&stats(100));
        assert!(hub.is_degraded());
    }
}
