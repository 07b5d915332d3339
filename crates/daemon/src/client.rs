//! Per-client playback session
//!
//! Each WebSocket connection owns one session: a ring buffer, a lazily
//! spawned audio-sink child, and the play-state machine
//! `Idle → Playing → (Paused|EndingStream) → Completed → Idle`, with `Stopped`
//! reachable from anywhere. End-of-stream always routes through
//! drain-and-complete; only the `stop` action kills the sink.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use lyra_config::DaemonSettings;
use lyra_core::AudioFormat;

use crate::protocol::{
    now_ms, AudioChunkData, ClientFrame, ControlAction, ErrorData, ServerFrame, StatusData,
};
use crate::ring::RingBuffer;
use crate::sink::AudioSink;

/// Play-state of one client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Idle,
    Playing,
    Paused,
    EndingStream,
    Completed,
    Stopped,
}

impl PlayState {
    pub fn label(self) -> &'static str {
        match self {
            PlayState::Idle => "idle",
            PlayState::Playing => "playing",
            PlayState::Paused => "paused",
            PlayState::EndingStream => "ending_stream",
            PlayState::Completed => "completed",
            PlayState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub chunks_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub underruns: AtomicU32,
    pub sink_restarts: AtomicU32,
}

/// One connected client
pub struct ClientSession {
    pub id: Uuid,
    settings: DaemonSettings,
    format: Mutex<AudioFormat>,
    ring: Mutex<Arc<RingBuffer>>,
    state_tx: watch::Sender<PlayState>,
    highest_seq: Mutex<Option<u64>>,
    gap_reported: AtomicBool,
    completed_sent: AtomicBool,
    out_tx: mpsc::Sender<ServerFrame>,
    feeder: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub stats: SessionStats,
}

impl ClientSession {
    pub fn new(settings: DaemonSettings, out_tx: mpsc::Sender<ServerFrame>) -> Arc<Self> {
        let format = AudioFormat::default();
        let (state_tx, _) = watch::channel(PlayState::Idle);
        Arc::new(Self {
            id: Uuid::new_v4(),
            ring: Mutex::new(Arc::new(Self::fresh_ring(&settings, format))),
            settings,
            format: Mutex::new(format),
            state_tx,
            highest_seq: Mutex::new(None),
            gap_reported: AtomicBool::new(false),
            completed_sent: AtomicBool::new(false),
            out_tx,
            feeder: Mutex::new(None),
            stats: SessionStats::default(),
        })
    }

    fn fresh_ring(settings: &DaemonSettings, format: AudioFormat) -> RingBuffer {
        let capacity =
            (format.bytes_per_second() as f64 * settings.ring_seconds).max(1024.0) as usize;
        RingBuffer::new(capacity, settings.ring_growth_ceiling)
    }

    pub fn state(&self) -> PlayState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: PlayState) {
        let prev = self.state();
        if prev != next {
            tracing::debug!(
                client = %self.id,
                from = prev.label(),
                to = next.label(),
                "Play state transition"
            );
            let _ = self.state_tx.send(next);
        }
    }

    async fn send(&self, frame: ServerFrame) {
        if self.out_tx.send(frame).await.is_err() {
            tracing::debug!(client = %self.id, "Outbound channel closed");
        }
    }

    /// Dispatch one parsed frame
    pub async fn handle_frame(self: &Arc<Self>, frame: ClientFrame) {
        match frame {
            ClientFrame::Heartbeat { .. } => {
                self.send(ServerFrame::Heartbeat {
                    timestamp: now_ms(),
                })
                .await;
            },
            ClientFrame::Status { .. } => {
                self.send_status().await;
            },
            ClientFrame::TimingAnalysis { data, .. } => {
                self.send(ServerFrame::TimingAnalysis {
                    timestamp: now_ms(),
                    data,
                })
                .await;
            },
            ClientFrame::EndStream { .. } => {
                self.end_stream().await;
            },
            ClientFrame::Control { data, .. } => match data.action {
                ControlAction::Play => self.play(),
                ControlAction::Pause => self.pause(),
                ControlAction::Resume => self.resume(),
                ControlAction::Stop => self.stop().await,
                ControlAction::EndStream => self.end_stream().await,
            },
            ClientFrame::AudioChunk { data, .. } => {
                self.on_chunk(data).await;
            },
        }
    }

    pub async fn send_status(&self) {
        let frame = ServerFrame::Status {
            timestamp: now_ms(),
            data: StatusData {
                state: self.state().label().to_string(),
                buffered_bytes: self.ring.lock().available(),
                highest_seq: *self.highest_seq.lock(),
            },
        };
        self.send(frame).await;
    }

    async fn on_chunk(self: &Arc<Self>, data: AudioChunkData) {
        // A fresh utterance on a drained or stopped session gets a fresh
        // ring and sink; nothing leaks from the previous playback
        if self.state() == PlayState::Idle && self.ring.lock().is_finished() {
            self.reset_for_new_utterance();
        }

        if let Some(spec) = data.format {
            match spec.to_format() {
                Some(format) if self.state() == PlayState::Idle => {
                    *self.format.lock() = format;
                },
                Some(_) => {
                    tracing::warn!(client = %self.id, "Format change ignored mid-stream");
                },
                None => {
                    self.error("invalid_format", "unsupported channel count or bit depth", None)
                        .await;
                    return;
                },
            }
        }

        let bytes = match data.decode() {
            Ok(b) => b,
            Err(e) => {
                self.error("invalid_chunk", &format!("base64 decode failed: {e}"), None)
                    .await;
                return;
            },
        };

        // Dedup and gap detection on the utterance-monotonic sequence
        if let Some(seq) = data.seq {
            enum SeqCheck {
                Accept,
                Duplicate,
                Gap { expected: u64 },
            }
            let check = {
                let mut highest = self.highest_seq.lock();
                match *highest {
                    Some(h) if seq <= h => SeqCheck::Duplicate,
                    Some(h) if seq > h + 1 => {
                        highest.replace(seq);
                        SeqCheck::Gap { expected: h + 1 }
                    },
                    _ => {
                        highest.replace(seq);
                        SeqCheck::Accept
                    },
                }
            };
            match check {
                SeqCheck::Duplicate => {
                    self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                },
                SeqCheck::Gap { expected } => {
                    // One-shot replay request per utterance; the chunk in
                    // hand is still accepted
                    if !self.gap_reported.swap(true, Ordering::SeqCst) {
                        tracing::warn!(client = %self.id, expected, got = seq, "Sequence gap");
                        self.error(
                            "sequence_gap",
                            "chunk sequence gap; requesting replay",
                            Some(expected),
                        )
                        .await;
                    }
                },
                SeqCheck::Accept => {},
            }
        }

        self.after_accept(bytes, data.is_last_of_utterance).await;
    }

    async fn after_accept(self: &Arc<Self>, bytes: Vec<u8>, is_last: Option<bool>) {
        self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let ring = Arc::clone(&self.ring.lock());
        if let Err(e) = ring.write(&bytes) {
            tracing::error!(client = %self.id, error = %e, "Ring write failed");
            self.error("ring_capacity", &e.to_string(), None).await;
            self.stop().await;
            return;
        }

        if is_last == Some(true) {
            ring.mark_finished();
            if self.state() == PlayState::Playing {
                self.set_state(PlayState::EndingStream);
            }
        }

        if self.state() == PlayState::Idle {
            self.start_playback();
        }
    }

    /// First chunk: spawn the sink and the feeder task
    fn start_playback(self: &Arc<Self>) {
        self.set_state(PlayState::Playing);
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            session.feed().await;
        });
        if let Some(old) = self.feeder.lock().replace(handle) {
            old.abort();
        }
    }

    fn reset_for_new_utterance(&self) {
        let format = *self.format.lock();
        *self.ring.lock() = Arc::new(Self::fresh_ring(&self.settings, format));
        *self.highest_seq.lock() = None;
        self.gap_reported.store(false, Ordering::SeqCst);
        self.completed_sent.store(false, Ordering::SeqCst);
        tracing::debug!(client = %self.id, "Reset for new utterance");
    }

    fn play(&self) {
        match self.state() {
            PlayState::Stopped | PlayState::Completed => {
                self.reset_for_new_utterance();
                self.set_state(PlayState::Idle);
            },
            PlayState::Paused => self.set_state(PlayState::Playing),
            _ => {},
        }
    }

    fn pause(&self) {
        if self.state() == PlayState::Playing {
            self.set_state(PlayState::Paused);
        }
    }

    fn resume(&self) {
        if self.state() == PlayState::Paused {
            self.set_state(PlayState::Playing);
        }
    }

    /// Drain-and-complete; never a force stop
    async fn end_stream(&self) {
        match self.state() {
            PlayState::Playing | PlayState::Paused => {
                self.ring.lock().mark_finished();
                self.set_state(PlayState::EndingStream);
            },
            PlayState::Idle => {
                // Nothing buffered and no sink; complete directly
                self.ring.lock().mark_finished();
                self.emit_completed().await;
            },
            _ => {},
        }
    }

    /// Kill the sink, keep the buffer for inspection, stop draining
    async fn stop(&self) {
        self.set_state(PlayState::Stopped);
        // Feeder observes the state change and kills the sink
    }

    async fn emit_completed(&self) {
        if !self.completed_sent.swap(true, Ordering::SeqCst) {
            self.send(ServerFrame::Completed {
                timestamp: now_ms(),
            })
            .await;
            metrics::counter!("lyra_daemon_completed_total").increment(1);
        }
    }

    /// Send a fully formed error frame; used by the server for unknown
    /// frame types
    pub async fn send_error(&self, data: ErrorData) {
        self.send(ServerFrame::Error {
            timestamp: now_ms(),
            data,
        })
        .await;
    }

    async fn error(&self, code: &str, message: &str, expected_seq: Option<u64>) {
        self.send(ServerFrame::Error {
            timestamp: now_ms(),
            data: ErrorData {
                code: code.to_string(),
                message: message.to_string(),
                expected_seq,
            },
        })
        .await;
    }

    /// Feeder loop: sole consumer of the ring, sole writer to the sink
    async fn feed(self: Arc<Self>) {
        let format = *self.format.lock();
        let ring = Arc::clone(&self.ring.lock());
        let mut state_rx = self.state_tx.subscribe();

        let mut sink = match AudioSink::spawn(&self.settings, format) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "Sink spawn failed");
                self.error("sink_spawn", &e.to_string(), None).await;
                self.set_state(PlayState::Stopped);
                return;
            },
        };

        let unit = format.bytes_for_ms(self.settings.sink_write_ms).max(2);
        let window = Duration::from_secs(self.settings.sink_restart_window_secs);
        let mut restarts: VecDeque<Instant> = VecDeque::new();
        // The unit taken from the ring but not yet confirmed into the sink;
        // a restart resumes from this unit so no buffered byte is skipped
        let mut pending: Option<Vec<u8>> = None;

        loop {
            match self.state() {
                PlayState::Stopped => {
                    sink.kill().await;
                    tracing::info!(client = %self.id, "Playback stopped; sink killed");
                    return;
                },
                PlayState::Paused => {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                },
                _ => {},
            }

            let bytes = if let Some(b) = pending.take() {
                b
            } else {
                if ring.available() == 0 && !ring.is_finished() {
                    self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                }
                let next = tokio::select! {
                    biased;
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    b = ring.read_wait(unit) => b,
                };
                match next {
                    Some(b) => b,
                    None => {
                        // Drained with the finished flag set
                        match sink.finish().await {
                            Ok(()) => {},
                            Err(e) => {
                                tracing::warn!(client = %self.id, error = %e, "Sink exit unclean")
                            },
                        }
                        self.emit_completed().await;
                        self.set_state(PlayState::Completed);
                        self.set_state(PlayState::Idle);
                        return;
                    },
                }
            };

            if let Err(e) = sink.write(&bytes).await {
                pending = Some(bytes);
                let now = Instant::now();
                while restarts
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    restarts.pop_front();
                }
                if restarts.len() >= self.settings.sink_restart_max as usize {
                    tracing::error!(client = %self.id, error = %e, "Sink restart budget exhausted");
                    self.error("sink_failed", "audio sink died repeatedly", None)
                        .await;
                    self.set_state(PlayState::Stopped);
                    return;
                }

                restarts.push_back(now);
                self.stats.sink_restarts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    client = %self.id,
                    restarts = restarts.len(),
                    error = %e,
                    "Sink died with data buffered; restarting"
                );
                match AudioSink::spawn(&self.settings, format) {
                    Ok(s) => sink = s,
                    Err(spawn_err) => {
                        self.error("sink_spawn", &spawn_err.to_string(), None).await;
                        self.set_state(PlayState::Stopped);
                        return;
                    },
                }
            }
        }
    }

    /// Tear down on connection close
    pub async fn close(&self) {
        self.set_state(PlayState::Stopped);
        let handle = self.feeder.lock().take();
        if let Some(handle) = handle {
            // Give the feeder a moment to kill the sink cleanly
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(handle) = self.feeder.lock().take() {
            handle.abort();
        }
    }
}
