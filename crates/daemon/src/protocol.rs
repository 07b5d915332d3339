//! WebSocket frame protocol
//!
//! Small JSON control frames plus base64-wrapped audio chunks, tagged by
//! `type`. Client frames drive the play-state machine; server frames report
//! state, ack heartbeats, and signal completion exactly once per utterance.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use lyra_core::{AudioFormat, BitDepth, Channels, SampleRate};

/// Frames the daemon accepts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Transport control
    Control {
        #[serde(default)]
        timestamp: Option<i64>,
        data: ControlData,
    },
    /// One tagged PCM chunk
    AudioChunk {
        #[serde(default)]
        timestamp: Option<i64>,
        data: AudioChunkData,
    },
    /// Drain-and-complete; equivalent to `control.end_stream`
    EndStream {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Liveness ping; acked with a server timestamp
    Heartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Client-side timing report, echoed for tooling
    TimingAnalysis {
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Request a status frame
    Status {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlData {
    pub action: ControlAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Play,
    Pause,
    Resume,
    Stop,
    EndStream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunkData {
    /// Base64-encoded PCM bytes
    pub chunk: String,
    /// Utterance-monotonic sequence number; enables dedup and gap detection
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub is_last_of_utterance: Option<bool>,
    /// Explicit format; applied before the sink spawns
    #[serde(default)]
    pub format: Option<FormatSpec>,
}

impl AudioChunkData {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.chunk)
    }

    pub fn encode(bytes: &[u8], seq: u64, is_last: bool) -> Self {
        Self {
            chunk: BASE64.encode(bytes),
            seq: Some(seq),
            is_last_of_utterance: Some(is_last),
            format: None,
        }
    }
}

/// Wire form of an audio format
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FormatSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl FormatSpec {
    pub fn to_format(self) -> Option<AudioFormat> {
        Some(AudioFormat {
            sample_rate: SampleRate::from_hz(self.sample_rate),
            channels: Channels::from_count(self.channels)?,
            bit_depth: BitDepth::from_bits(self.bit_depth)?,
        })
    }

    pub fn from_format(format: AudioFormat) -> Self {
        Self {
            sample_rate: format.sample_rate.as_u32(),
            channels: format.channels.count() as u16,
            bit_depth: format.bit_depth.bits(),
        }
    }
}

/// Frames the daemon emits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Status {
        timestamp: i64,
        data: StatusData,
    },
    /// Heartbeat ack
    Heartbeat {
        timestamp: i64,
    },
    /// Emitted exactly once per utterance
    Completed {
        timestamp: i64,
    },
    Error {
        timestamp: i64,
        data: ErrorData,
    },
    TimingAnalysis {
        timestamp: i64,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub state: String,
    pub buffered_bytes: usize,
    pub highest_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    /// Set on `sequence_gap`: the next sequence number the daemon expects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_seq: Option<u64>,
}

/// Millisecond wallclock for frame timestamps
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
