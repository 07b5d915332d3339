//! Core types for the lyra streaming TTS engine
//!
//! This crate provides foundational types used across all other crates:
//! - Audio formats, PCM conversion, resampling, cross-fade
//! - WAV header construction for streamed and collected responses
//! - The segment/chunk/utterance data model
//! - Traits for the opaque collaborators (synthesizer, G2P, hardware probe)
//! - The error taxonomy

pub mod audio;
pub mod chunk;
pub mod error;
pub mod traits;
pub mod wav;

pub use audio::{
    cross_fade, mono_to_stereo, pcm16_to_samples, resample, rms_db, samples_to_pcm, AudioFormat,
    BitDepth, Channels, SampleRate,
};
pub use chunk::{Chunk, Segment, Utterance, UtteranceConfig, UtteranceState};
pub use error::{Result, SpeechError};
pub use traits::{G2p, GenericProbe, HardwareProbe, HardwareReport, Style, Synthesizer, TokenSeq};
