//! Streaming synthesis engine for lyra
//!
//! The core of the service: deterministic text segmentation, a three-slot
//! inference session pool with calibrated provider selection, a pipelined
//! scheduler with dual-session prefetch and primer caching, warmup and
//! keep-alive lifecycle, chunk sequencing, and SLO gates.

pub mod engine;
pub mod g2p;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod primer;
pub mod scheduler;
pub mod segment;
pub mod select;
pub mod sequencer;
pub mod synth;

pub use engine::{Engine, EngineBackends, SpeakRequest};
pub use g2p::{CharG2p, EnglishG2p, G2pConfig};
pub use lifecycle::{LifecycleManager, WarmPattern};
pub use metrics::{GateState, MetricsHub, UtteranceStats, UtteranceTimer};
pub use pool::{PoolSnapshot, SessionGuard, SessionKind, SessionPool, SessionState};
pub use primer::{PrimerCache, PrimerKey};
pub use scheduler::{Scheduler, StreamEvent, UtteranceHandle};
pub use segment::{Segmenter, SegmenterConfig};
pub use select::select;
pub use sequencer::ChunkSequencer;
pub use synth::{BackendKind, FlakySynthesizer, SilenceSynthesizer, ToneSynthesizer};
