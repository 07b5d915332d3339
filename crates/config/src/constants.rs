//! Centralized constants for the lyra service
//!
//! Single source of truth for the calibrated defaults documented for the
//! reference hardware class. Anything a deployment might retune lives in
//! `Settings` with these values as serde defaults; anything structural
//! (frame math, protocol sizes) lives only here.

/// Segmenter calibration
pub mod segmenter {
    /// Default per-request cap on segment length (characters)
    pub const MAX_CHARS: usize = 1800;

    /// Hard ceiling at the synthesizer interface; never exceeded
    pub const HARD_CAP: usize = 2000;

    /// Segment 0 at or below this length is primer-eligible
    pub const PRIMER_THRESHOLD: usize = 280;
}

/// Provider selector calibration
pub mod selector {
    /// At or below this many characters the accelerator wins on TTFA
    pub const SHORT_CAP: usize = 200;

    /// At or above this many characters the co-processor holds a steadier cadence
    pub const LONG_CAP: usize = 1000;

    /// Stickiness band around the criterion; staying on the previous
    /// session avoids context thrash
    pub const HYSTERESIS_PCT: f64 = 0.15;
}

/// Session pool health model
pub mod pool {
    /// Consecutive inference errors before a session is marked Failed
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

    /// Ops on one session before a scoped cleanup is scheduled
    pub const OPS_PER_CLEANUP: u32 = 50;

    /// Wallclock seconds before a scoped cleanup is scheduled
    pub const CLEANUP_AFTER_SECS: u64 = 60;
}

/// Scheduler and sequencer timing
pub mod stream {
    /// Target audio duration per chunk (ms)
    pub const CHUNK_MS: u64 = 50;

    /// Silence primer injected after the format header (ms)
    pub const SILENCE_PRIMER_MS: u64 = 50;

    /// Cross-fade window at segment seams (ms); 0 disables
    pub const CROSS_FADE_MS: u64 = 10;

    /// Stage C holds at most this many completed future segments
    pub const REORDER_WINDOW: usize = 1;

    /// Per-segment deadline as a multiple of expected duration
    pub const DEADLINE_FACTOR: f64 = 3.0;
}

/// Warmup and keep-alive cadence
pub mod lifecycle {
    /// Keep-alive period (seconds)
    pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 300;

    /// Keep-alive is skipped when a request ran within this window (seconds)
    pub const KEEP_ALIVE_SUPPRESS_SECS: u64 = 120;

    /// Accelerator inferences between scoped cleanups
    pub const OPS_PER_SCOPED_CLEANUP: u32 = 50;
}

/// Playback daemon sizing
pub mod daemon {
    /// Ring buffer size in seconds of audio at the stream format
    pub const RING_SECONDS: f64 = 2.0;

    /// Hard ceiling on ring growth as a multiple of the initial capacity
    pub const RING_GROWTH_CEILING: usize = 8;

    /// Sink restarts allowed within the restart window
    pub const SINK_RESTART_MAX: u32 = 3;

    /// Sink restart budget window (seconds)
    pub const SINK_RESTART_WINDOW_SECS: u64 = 30;

    /// Preferred sink write unit (ms of audio)
    pub const SINK_WRITE_MS: u64 = 50;
}

/// SLO gate calibration
pub mod slo {
    /// Utterances in the sliding aggregation window
    pub const WINDOW: usize = 20;

    /// Target time-to-first-audio (ms)
    pub const TTFA_TARGET_MS: u64 = 500;

    /// Degrade when p95 TTFA exceeds target by this factor
    pub const DEGRADE_FACTOR: f64 = 2.0;
}

/// Request validation bounds
pub mod request {
    /// Speed multiplier bounds accepted at the API
    pub const SPEED_MIN: f32 = 0.25;
    pub const SPEED_MAX: f32 = 4.0;
}
