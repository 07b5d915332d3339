//! Persistent audio playback daemon
//!
//! A long-lived process exposing a framed WebSocket protocol. Each client
//! gets a ring buffer and a lazily spawned audio-sink child process; the
//! feeder loop drains the ring into the sink with backpressure, restart
//! budgets, and exactly-once completion.

pub mod client;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod sink;

pub use client::{ClientSession, PlayState, SessionStats};
pub use protocol::{
    now_ms, AudioChunkData, ClientFrame, ControlAction, ControlData, ErrorData, FormatSpec,
    ServerFrame, StatusData,
};
pub use ring::RingBuffer;
pub use server::{create_router, DaemonState};
pub use sink::AudioSink;

use thiserror::Error;

/// Daemon-side failures
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("ring buffer hard capacity ceiling reached ({0} bytes)")]
    RingCapacityExceeded(usize),

    #[error("failed to spawn audio sink: {0}")]
    SinkSpawn(String),

    #[error("audio sink died: {0}")]
    SinkDied(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}
