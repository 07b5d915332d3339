//! WebSocket client for the playback daemon
//!
//! Forwards an utterance's chunk stream to the daemon as `audio_chunk`
//! frames, retains a replay window for gap recovery, and waits for the
//! daemon's exactly-once `completed` frame before reporting success.

use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use lyra_core::{AudioFormat, SpeechError, UtteranceState};
use lyra_daemon::{AudioChunkData, ClientFrame, FormatSpec, ServerFrame};
use lyra_engine::{StreamEvent, UtteranceHandle};

/// Chunks retained for replay after a daemon-reported sequence gap
///
/// Frames are kept exactly as sent, so a replay reuses the sequence
/// numbers the sequencer first issued and the daemon dedups by `seq`.
const REPLAY_WINDOW: usize = 128;

/// How long to wait for `completed` after `end_stream`
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(15);

/// Client to one playback daemon
pub struct DaemonClient {
    url: String,
}

/// Terminal result of forwarding one utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Daemon confirmed completion
    Completed,
    /// Utterance was cancelled before end of stream
    Cancelled,
    /// Synthesis failed; partial audio was delivered
    Failed,
}

impl DaemonClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward every chunk of `handle` to the daemon and drive playback to
    /// its terminal state
    pub async fn play(
        &self,
        mut handle: UtteranceHandle,
        format: AudioFormat,
    ) -> Result<PlayOutcome, SpeechError> {
        let (socket, _) = connect_async(&self.url)
            .await
            .map_err(|e| SpeechError::DaemonDisconnected(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        tracing::debug!(url = %self.url, "Connected to playback daemon");

        let mut sent: VecDeque<(u64, String)> = VecDeque::new();
        let mut first_chunk = true;
        let mut terminal: Option<PlayOutcome> = None;
        let mut completed_seen = false;

        loop {
            tokio::select! {
                event = handle.next() => match event {
                    Some(StreamEvent::Chunk(chunk)) => {
                        let mut data = AudioChunkData::encode(
                            &chunk.bytes,
                            chunk.seq,
                            chunk.is_last_of_utterance,
                        );
                        if first_chunk {
                            data.format = Some(FormatSpec::from_format(format));
                            first_chunk = false;
                        }
                        let frame = ClientFrame::AudioChunk {
                            timestamp: Some(lyra_daemon::now_ms()),
                            data,
                        };
                        let json = serde_json::to_string(&frame)
                            .map_err(|e| SpeechError::Internal(e.to_string()))?;

                        sent.push_back((chunk.seq, json.clone()));
                        while sent.len() > REPLAY_WINDOW {
                            sent.pop_front();
                        }

                        ws_tx
                            .send(Message::Text(json))
                            .await
                            .map_err(|e| SpeechError::DaemonDisconnected(e.to_string()))?;
                    },
                    Some(StreamEvent::Error { segment_id, message }) => {
                        tracing::error!(?segment_id, message, "Forwarding utterance error");
                        terminal = Some(PlayOutcome::Failed);
                    },
                    Some(StreamEvent::Finished { state, .. }) => {
                        match state {
                            UtteranceState::Completed => {
                                let frame = ClientFrame::EndStream {
                                    timestamp: Some(lyra_daemon::now_ms()),
                                };
                                let json = serde_json::to_string(&frame)
                                    .map_err(|e| SpeechError::Internal(e.to_string()))?;
                                ws_tx
                                    .send(Message::Text(json))
                                    .await
                                    .map_err(|e| {
                                        SpeechError::DaemonDisconnected(e.to_string())
                                    })?;
                                terminal.get_or_insert(PlayOutcome::Completed);
                            },
                            UtteranceState::Cancelled => {
                                terminal = Some(PlayOutcome::Cancelled);
                            },
                            _ => {
                                terminal.get_or_insert(PlayOutcome::Failed);
                            },
                        }
                    },
                    None => break,
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_daemon_frame(&text, &sent, &mut ws_tx).await? {
                            completed_seen = true;
                        }
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        return Err(SpeechError::DaemonDisconnected(e.to_string()));
                    },
                    None => {
                        return Err(SpeechError::DaemonDisconnected(
                            "daemon closed connection".to_string(),
                        ));
                    },
                },
            }
        }

        let outcome = terminal.unwrap_or(PlayOutcome::Failed);
        if outcome != PlayOutcome::Completed {
            return Ok(outcome);
        }

        // Drain until the daemon confirms completion, unless it already did
        // while chunks were still in flight
        let confirmed = completed_seen
            || tokio::time::timeout(COMPLETION_TIMEOUT, async {
                while let Some(msg) = ws_rx.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            // Replay requests can still arrive while draining
                            match self.handle_daemon_frame(&text, &sent, &mut ws_tx).await {
                                Ok(true) => return true,
                                Ok(false) => {},
                                Err(_) => return false,
                            }
                        },
                        Ok(_) => {},
                        Err(_) => return false,
                    }
                }
                false
            })
            .await
            .unwrap_or(false);

        if confirmed {
            tracing::info!("Daemon confirmed playback completion");
            Ok(PlayOutcome::Completed)
        } else {
            Err(SpeechError::DaemonDisconnected(
                "no completion confirmation".to_string(),
            ))
        }
    }

    /// React to a daemon frame; replays retained chunks on `sequence_gap`
    ///
    /// Returns true when the frame was the daemon's `completed` signal.
    async fn handle_daemon_frame<S>(
        &self,
        text: &str,
        sent: &VecDeque<(u64, String)>,
        ws_tx: &mut S,
    ) -> Result<bool, SpeechError>
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(_) => {
                tracing::debug!("Unparseable daemon frame ignored");
                return Ok(false);
            },
        };

        match frame {
            ServerFrame::Completed { .. } => return Ok(true),
            ServerFrame::Error { data, .. } if data.code == "sequence_gap" => {
                let Some(expected) = data.expected_seq else {
                    return Ok(false);
                };
                let replayable: Vec<&String> = sent
                    .iter()
                    .filter(|(seq, _)| *seq >= expected)
                    .map(|(_, json)| json)
                    .collect();
                tracing::warn!(
                    expected,
                    frames = replayable.len(),
                    "Daemon requested replay"
                );
                for json in replayable {
                    ws_tx
                        .send(Message::Text(json.clone()))
                        .await
                        .map_err(|e| SpeechError::DaemonDisconnected(e.to_string()))?;
                }
            },
            ServerFrame::Error { data, .. } => {
                tracing::warn!(code = %data.code, message = %data.message, "Daemon error frame");
            },
            ServerFrame::Status { data, .. } => {
                tracing::trace!(state = %data.state, buffered = data.buffered_bytes, "Daemon status");
            },
            _ => {},
        }
        Ok(false)
    }
}
