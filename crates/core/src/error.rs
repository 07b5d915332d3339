//! Error taxonomy shared across the engine and transports

use thiserror::Error;

/// Errors produced anywhere in the synthesis path
///
/// `Cancelled` is a control-flow outcome, never surfaced to the user as a
/// failure. Transport-side errors (`DaemonDisconnected`, `SinkDied`,
/// `RingCapacityExceeded`) originate in the playback daemon and cross back
/// into the engine only as degradation signals.
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("segmentation failed: {0}")]
    SegmentationFailed(String),

    #[error("grapheme-to-phoneme conversion failed: {0}")]
    G2pFailed(String),

    #[error("no inference session available")]
    SessionUnavailable,

    #[error("synthesis failed on segment {segment_id}: {reason}")]
    SynthesisFailed { segment_id: u32, reason: String },

    #[error("provider degraded: {0}")]
    ProviderDegraded(String),

    #[error("playback daemon disconnected: {0}")]
    DaemonDisconnected(String),

    #[error("audio sink died: {0}")]
    SinkDied(String),

    #[error("ring buffer hard capacity ceiling reached ({0} bytes)")]
    RingCapacityExceeded(usize),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SpeechError {
    /// Whether the caller may retry on another session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpeechError::SynthesisFailed { .. }
                | SpeechError::ProviderDegraded(_)
                | SpeechError::SessionUnavailable
        )
    }
}

pub type Result<T> = std::result::Result<T, SpeechError>;
