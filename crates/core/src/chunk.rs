//! Streaming data model: segments, chunks, and utterances
//!
//! A synthesis request becomes one Utterance; the segmenter slices its text
//! into Segments; the scheduler turns each segment into ordered Chunks of
//! PCM whose concatenation in `seq` order is the complete audio stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::AudioFormat;

/// An immutable ordered text fragment produced by the segmenter
///
/// Segment ids within one utterance are a contiguous ascending run starting
/// at 0. The primer flag may only be set on segment 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: u32,
    pub text: String,
    /// Character count of `text`, cached because the selector consults it
    pub char_len: usize,
    pub is_primer: bool,
}

impl Segment {
    pub fn new(id: u32, text: impl Into<String>) -> Self {
        let text = text.into();
        let char_len = text.chars().count();
        Self {
            id,
            text,
            char_len,
            is_primer: false,
        }
    }

    pub fn primer(id: u32, text: impl Into<String>) -> Self {
        let mut s = Self::new(id, text);
        s.is_primer = true;
        s
    }
}

/// A tagged slice of PCM bytes
///
/// `seq` is monotonic across the whole utterance and survives replays:
/// a replayed chunk carries the exact sequence number of its first send so
/// the playback daemon can deduplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub segment_id: u32,
    /// Position within the segment
    pub chunk_id: u32,
    pub seq: u64,
    pub bytes: Vec<u8>,
    pub is_last_of_segment: bool,
    pub is_last_of_utterance: bool,
}

/// Per-request synthesis parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtteranceConfig {
    pub voice: String,
    pub speed: f32,
    pub lang: String,
    pub format: AudioFormat,
    /// Cross-fade window at segment seams; 0 disables
    pub cross_fade_ms: u64,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            voice: "af_heart".to_string(),
            speed: 1.0,
            lang: "en-us".to_string(),
            format: AudioFormat::default(),
            cross_fade_ms: 10,
        }
    }
}

/// Utterance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UtteranceState {
    Planning,
    Streaming,
    Draining,
    Completed,
    Cancelled,
    Failed,
}

/// One synthesis request driven to completion by the scheduler
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: Uuid,
    pub config: UtteranceConfig,
    pub segments: Vec<Segment>,
    pub state: UtteranceState,
}

impl Utterance {
    pub fn new(config: UtteranceConfig, segments: Vec<Segment>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            segments,
            state: UtteranceState::Planning,
        }
    }

    /// Empty input collapses straight to Completed
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
