//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{daemon, lifecycle, pool, request, segmenter, selector, slo, stream};
use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// HTTP synthesis server
    #[serde(default)]
    pub server: ServerSettings,

    /// Playback daemon
    #[serde(default)]
    pub daemon: DaemonSettings,

    /// Text segmentation
    #[serde(default)]
    pub segmenter: SegmenterSettings,

    /// Provider selection thresholds
    #[serde(default)]
    pub selector: SelectorSettings,

    /// Session pool health model
    #[serde(default)]
    pub pool: PoolSettings,

    /// Scheduler and chunk stream timing
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Warmup, keep-alive and leak mitigation
    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    /// SLO gates
    #[serde(default)]
    pub slo: SloSettings,

    /// Model paths
    #[serde(default)]
    pub models: ModelSettings,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

/// Model file locations
///
/// With no synthesizer model configured the service runs on the built-in
/// deterministic backend, which keeps development and CI model-free.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelSettings {
    /// ONNX synthesizer model path
    #[serde(default)]
    pub synthesizer_path: Option<String>,

    /// Voice style pack path
    #[serde(default)]
    pub voices_path: Option<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address; the service is loopback-only by contract
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8880
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            timeout_seconds: default_timeout_secs(),
        }
    }
}

/// Playback daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_daemon_port")]
    pub port: u16,

    /// Ring buffer size in seconds of audio at the stream format
    #[serde(default = "default_ring_seconds")]
    pub ring_seconds: f64,

    /// Hard ceiling on ring growth as a multiple of initial capacity
    #[serde(default = "default_ring_growth_ceiling")]
    pub ring_growth_ceiling: usize,

    /// Command spawned lazily as the audio sink; reads PCM on stdin
    #[serde(default = "default_sink_command")]
    pub sink_command: String,

    /// Arguments for the sink command. `{rate}`, `{channels}` and `{bits}`
    /// are substituted from the negotiated stream format.
    #[serde(default = "default_sink_args")]
    pub sink_args: Vec<String>,

    /// Sink restarts allowed within the restart window
    #[serde(default = "default_sink_restart_max")]
    pub sink_restart_max: u32,

    /// Restart budget window (seconds)
    #[serde(default = "default_sink_restart_window")]
    pub sink_restart_window_secs: u64,

    /// Preferred sink write unit (ms of audio)
    #[serde(default = "default_sink_write_ms")]
    pub sink_write_ms: u64,
}

fn default_daemon_port() -> u16 {
    8881
}

fn default_ring_seconds() -> f64 {
    daemon::RING_SECONDS
}

fn default_ring_growth_ceiling() -> usize {
    daemon::RING_GROWTH_CEILING
}

fn default_sink_command() -> String {
    "play".to_string()
}

fn default_sink_args() -> Vec<String> {
    // SoX raw-PCM-on-stdin invocation
    [
        "-q", "-t", "raw", "-r", "{rate}", "-e", "signed", "-b", "{bits}", "-c", "{channels}", "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sink_restart_max() -> u32 {
    daemon::SINK_RESTART_MAX
}

fn default_sink_restart_window() -> u64 {
    daemon::SINK_RESTART_WINDOW_SECS
}

fn default_sink_write_ms() -> u64 {
    daemon::SINK_WRITE_MS
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_daemon_port(),
            ring_seconds: default_ring_seconds(),
            ring_growth_ceiling: default_ring_growth_ceiling(),
            sink_command: default_sink_command(),
            sink_args: default_sink_args(),
            sink_restart_max: default_sink_restart_max(),
            sink_restart_window_secs: default_sink_restart_window(),
            sink_write_ms: default_sink_write_ms(),
        }
    }
}

/// Text segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterSettings {
    /// Per-request cap on segment length (characters)
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Segment 0 at or below this is primer-eligible
    #[serde(default = "default_primer_threshold")]
    pub primer_threshold: usize,
}

fn default_max_chars() -> usize {
    segmenter::MAX_CHARS
}

fn default_primer_threshold() -> usize {
    segmenter::PRIMER_THRESHOLD
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            primer_threshold: default_primer_threshold(),
        }
    }
}

/// Provider selection thresholds
///
/// The empirical question of whether the accelerator or the CPU wins after
/// warmup is left to calibration; these are plain knobs, not a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSettings {
    #[serde(default = "default_short_cap")]
    pub short_cap: usize,

    #[serde(default = "default_long_cap")]
    pub long_cap: usize,

    #[serde(default = "default_hysteresis_pct")]
    pub hysteresis_pct: f64,
}

fn default_short_cap() -> usize {
    selector::SHORT_CAP
}

fn default_long_cap() -> usize {
    selector::LONG_CAP
}

fn default_hysteresis_pct() -> f64 {
    selector::HYSTERESIS_PCT
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            short_cap: default_short_cap(),
            long_cap: default_long_cap(),
            hysteresis_pct: default_hysteresis_pct(),
        }
    }
}

/// Session pool health model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    #[serde(default = "default_ops_per_cleanup")]
    pub ops_per_cleanup: u32,

    #[serde(default = "default_cleanup_after_secs")]
    pub cleanup_after_secs: u64,
}

fn default_max_consecutive_errors() -> u32 {
    pool::MAX_CONSECUTIVE_ERRORS
}

fn default_ops_per_cleanup() -> u32 {
    pool::OPS_PER_CLEANUP
}

fn default_cleanup_after_secs() -> u64 {
    pool::CLEANUP_AFTER_SECS
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            ops_per_cleanup: default_ops_per_cleanup(),
            cleanup_after_secs: default_cleanup_after_secs(),
        }
    }
}

/// Scheduler and chunk stream timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Target audio duration per chunk (ms)
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,

    /// Cross-fade window at segment seams (ms); 0 disables
    #[serde(default = "default_cross_fade_ms")]
    pub cross_fade_ms: u64,

    /// Per-segment deadline as a multiple of expected duration
    #[serde(default = "default_deadline_factor")]
    pub deadline_factor: f64,

    /// Allow two Stage-B workers when two non-CPU sessions are Ready
    #[serde(default = "default_true")]
    pub dual_session_prefetch: bool,
}

fn default_chunk_ms() -> u64 {
    stream::CHUNK_MS
}

fn default_cross_fade_ms() -> u64 {
    stream::CROSS_FADE_MS
}

fn default_deadline_factor() -> f64 {
    stream::DEADLINE_FACTOR
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            chunk_ms: default_chunk_ms(),
            cross_fade_ms: default_cross_fade_ms(),
            deadline_factor: default_deadline_factor(),
            dual_session_prefetch: true,
        }
    }
}

/// Warmup, keep-alive and leak mitigation toggles
///
/// Each field maps to a documented environment toggle
/// (`LYRA_LIFECYCLE__<FIELD>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Schedule deep warming to a background task instead of blocking readiness
    #[serde(default = "default_true")]
    pub defer_background_init: bool,

    /// Run the single synchronous warmup inference before declaring ready
    #[serde(default = "default_true")]
    pub enable_cold_start_warmup: bool,

    /// Warm only the preferred session; skip pattern coverage
    #[serde(default = "default_true")]
    pub minimal_warmup: bool,

    /// Skip temp-file cleanup during startup
    #[serde(default)]
    pub skip_startup_cleanup: bool,

    /// Pressure hint trips above this resident-memory level
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_s: u64,

    #[serde(default = "default_true")]
    pub keep_alive_enabled: bool,

    /// Pre-build primer cache entries for common openers during deep warming
    #[serde(default)]
    pub priming_mode: bool,

    /// Accelerator inferences between scoped cleanups
    #[serde(default = "default_ops_per_scoped_cleanup")]
    pub ops_per_scoped_cleanup: u32,
}

fn default_memory_threshold_mb() -> u64 {
    4096
}

fn default_keep_alive_interval() -> u64 {
    lifecycle::KEEP_ALIVE_INTERVAL_SECS
}

fn default_ops_per_scoped_cleanup() -> u32 {
    lifecycle::OPS_PER_SCOPED_CLEANUP
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            defer_background_init: true,
            enable_cold_start_warmup: true,
            minimal_warmup: true,
            skip_startup_cleanup: false,
            memory_threshold_mb: default_memory_threshold_mb(),
            keep_alive_interval_s: default_keep_alive_interval(),
            keep_alive_enabled: true,
            priming_mode: false,
            ops_per_scoped_cleanup: default_ops_per_scoped_cleanup(),
        }
    }
}

/// SLO gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloSettings {
    /// Utterances in the sliding aggregation window
    #[serde(default = "default_slo_window")]
    pub window: usize,

    #[serde(default = "default_ttfa_target_ms")]
    pub ttfa_target_ms: u64,

    /// Degrade when p95 TTFA exceeds target by this factor
    #[serde(default = "default_degrade_factor")]
    pub degrade_factor: f64,
}

fn default_slo_window() -> usize {
    slo::WINDOW
}

fn default_ttfa_target_ms() -> u64 {
    slo::TTFA_TARGET_MS
}

fn default_degrade_factor() -> f64 {
    slo::DEGRADE_FACTOR
}

impl Default for SloSettings {
    fn default() -> Self {
        Self {
            window: default_slo_window(),
            ttfa_target_ms: default_ttfa_target_ms(),
            degrade_factor: default_degrade_factor(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port cannot be 0".to_string(),
            });
        }

        if self.segmenter.max_chars == 0 || self.segmenter.max_chars > crate::constants::segmenter::HARD_CAP
        {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.max_chars".to_string(),
                message: format!(
                    "Must be in 1..={}, got {}",
                    crate::constants::segmenter::HARD_CAP,
                    self.segmenter.max_chars
                ),
            });
        }

        if self.selector.short_cap >= self.selector.long_cap {
            return Err(ConfigError::InvalidValue {
                field: "selector.short_cap".to_string(),
                message: format!(
                    "short_cap ({}) must be below long_cap ({})",
                    self.selector.short_cap, self.selector.long_cap
                ),
            });
        }

        if !(0.0..1.0).contains(&self.selector.hysteresis_pct) {
            return Err(ConfigError::InvalidValue {
                field: "selector.hysteresis_pct".to_string(),
                message: format!("Must be in [0, 1), got {}", self.selector.hysteresis_pct),
            });
        }

        if self.scheduler.chunk_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.chunk_ms".to_string(),
                message: "Chunk duration cannot be 0".to_string(),
            });
        }

        if self.pool.max_consecutive_errors == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.max_consecutive_errors".to_string(),
                message: "Must allow at least one error".to_string(),
            });
        }

        if self.daemon.ring_seconds <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.ring_seconds".to_string(),
                message: "Ring must hold a positive duration".to_string(),
            });
        }

        if self.slo.degrade_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "slo.degrade_factor".to_string(),
                message: "Degrade factor below 1.0 would trip on target-met traffic".to_string(),
            });
        }

        Ok(())
    }

    /// Validated speed bounds for incoming requests
    pub fn speed_bounds(&self) -> (f32, f32) {
        (request::SPEED_MIN, request::SPEED_MAX)
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (LYRA_ prefix, `__` separator)
/// 2. config/{env}.toml (if env specified)
/// 3. config/default.toml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("LYRA")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8880);
        assert_eq!(settings.segmenter.max_chars, 1800);
        assert_eq!(settings.selector.short_cap, 200);
        assert!(settings.lifecycle.keep_alive_enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_port_validation() {
        let mut settings = Settings::default();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_segmenter_cap_validation() {
        let mut settings = Settings::default();
        settings.segmenter.max_chars = 2001; // above hard ceiling
        assert!(settings.validate().is_err());

        settings.segmenter.max_chars = 2000;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_selector_threshold_ordering() {
        let mut settings = Settings::default();
        settings.selector.short_cap = 1200;
        settings.selector.long_cap = 1000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_degrade_factor_floor() {
        let mut settings = Settings::default();
        settings.slo.degrade_factor = 0.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_sink_args_default_is_raw_pcm() {
        let settings = DaemonSettings::default();
        assert!(settings.sink_args.iter().any(|a| a == "{rate}"));
        assert!(settings.sink_args.last().map(String::as_str) == Some("-"));
    }
}
