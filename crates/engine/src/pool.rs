//! Inference session pool
//!
//! Owns up to three sessions (accelerator-favoring, co-processor-favoring,
//! generic CPU), each behind its own lock so acquires on distinct kinds
//! never contend. Health transitions follow the pool state machine:
//! `Cold → Warming → Ready`, `Ready → Degraded → Ready` through scoped
//! cleanup, anything → `Failed` after enough consecutive inference errors.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;

use lyra_config::PoolSettings;
use lyra_core::{SpeechError, Style, Synthesizer};

/// Inference session flavor
///
/// The tagged variant replaces provider-switching class hierarchies: one
/// interface (`warm` / `synthesize` / `release` via [`Synthesizer`]), three
/// placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// ANE-favoring session; shortest TTFA on short text
    Accelerator,
    /// GPU-favoring session; steadier cadence on long text
    CoProcessor,
    /// CPU session; the dependable middle
    Generic,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [
        SessionKind::Accelerator,
        SessionKind::CoProcessor,
        SessionKind::Generic,
    ];

    fn index(self) -> usize {
        match self {
            SessionKind::Accelerator => 0,
            SessionKind::CoProcessor => 1,
            SessionKind::Generic => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionKind::Accelerator => "accelerator",
            SessionKind::CoProcessor => "coprocessor",
            SessionKind::Generic => "generic",
        }
    }
}

/// Session health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Cold,
    Warming,
    Ready,
    Degraded,
    Failed,
}

#[derive(Debug)]
struct Health {
    state: SessionState,
    consecutive_errors: u32,
    ops_since_cleanup: u32,
    last_cleanup: Instant,
    last_used: Instant,
}

struct Slot {
    kind: SessionKind,
    synth: Arc<dyn Synthesizer>,
    /// At most one inference runs on a session at a time
    exec: Arc<tokio::sync::Mutex<()>>,
    health: Mutex<Health>,
}

/// Read-only view of pool health, consumed by the provider selector
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    states: [SessionState; 3],
}

impl PoolSnapshot {
    pub fn state(&self, kind: SessionKind) -> SessionState {
        self.states[kind.index()]
    }

    pub fn is_ready(&self, kind: SessionKind) -> bool {
        self.state(kind) == SessionState::Ready
    }

    pub fn ready_kinds(&self) -> Vec<SessionKind> {
        SessionKind::ALL
            .into_iter()
            .filter(|k| self.is_ready(*k))
            .collect()
    }

    /// Number of Ready sessions that are not the generic CPU slot; the
    /// scheduler keys dual-worker prefetch off this
    pub fn ready_non_generic(&self) -> usize {
        [SessionKind::Accelerator, SessionKind::CoProcessor]
            .into_iter()
            .filter(|k| self.is_ready(*k))
            .count()
    }
}

/// Exclusive borrow of one session for the duration of one inference
pub struct SessionGuard {
    slot: Arc<Slot>,
    _exec: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("kind", &self.slot.kind)
            .finish()
    }
}

impl SessionGuard {
    pub fn kind(&self) -> SessionKind {
        self.slot.kind
    }

    pub async fn synthesize(
        &self,
        tokens: &[i64],
        style: &Style,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        self.slot.synth.synthesize(tokens, style, speed).await
    }

    pub async fn warm(&self) -> Result<(), SpeechError> {
        self.slot.synth.warm().await
    }

    pub async fn release(&self) -> Result<(), SpeechError> {
        self.slot.synth.release().await
    }

    pub fn sample_rate(&self) -> u32 {
        self.slot.synth.sample_rate()
    }
}

/// The session pool
pub struct SessionPool {
    slots: [Arc<Slot>; 3],
    config: PoolSettings,
}

impl SessionPool {
    /// Build a pool from three backends in kind order
    pub fn new(
        accelerator: Arc<dyn Synthesizer>,
        coprocessor: Arc<dyn Synthesizer>,
        generic: Arc<dyn Synthesizer>,
        config: PoolSettings,
    ) -> Self {
        let slot = |kind: SessionKind, synth: Arc<dyn Synthesizer>| {
            Arc::new(Slot {
                kind,
                synth,
                exec: Arc::new(tokio::sync::Mutex::new(())),
                health: Mutex::new(Health {
                    state: SessionState::Cold,
                    consecutive_errors: 0,
                    ops_since_cleanup: 0,
                    last_cleanup: Instant::now(),
                    last_used: Instant::now(),
                }),
            })
        };

        Self {
            slots: [
                slot(SessionKind::Accelerator, accelerator),
                slot(SessionKind::CoProcessor, coprocessor),
                slot(SessionKind::Generic, generic),
            ],
            config,
        }
    }

    fn slot(&self, kind: SessionKind) -> &Arc<Slot> {
        &self.slots[kind.index()]
    }

    pub fn state(&self, kind: SessionKind) -> SessionState {
        self.slot(kind).health.lock().state
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            states: [
                self.state(SessionKind::Accelerator),
                self.state(SessionKind::CoProcessor),
                self.state(SessionKind::Generic),
            ],
        }
    }

    /// Acquire `kind` for one inference
    ///
    /// Waits if the same session is busy; never blocks acquires of other
    /// kinds. Fails fast if the session is `Failed`, or with
    /// `SessionUnavailable` when every session is `Failed`.
    pub async fn acquire(&self, kind: SessionKind) -> Result<SessionGuard, SpeechError> {
        if SessionKind::ALL
            .iter()
            .all(|k| self.state(*k) == SessionState::Failed)
        {
            return Err(SpeechError::SessionUnavailable);
        }
        if self.state(kind) == SessionState::Failed {
            return Err(SpeechError::ProviderDegraded(format!(
                "session {} is failed",
                kind.label()
            )));
        }

        let slot = Arc::clone(self.slot(kind));
        let exec = Arc::clone(&slot.exec).lock_owned().await;
        slot.health.lock().last_used = Instant::now();
        Ok(SessionGuard { slot, _exec: exec })
    }

    pub fn mark_warming(&self, kind: SessionKind) {
        self.slot(kind).health.lock().state = SessionState::Warming;
    }

    pub fn mark_ready(&self, kind: SessionKind) {
        let mut h = self.slot(kind).health.lock();
        h.state = SessionState::Ready;
        h.consecutive_errors = 0;
    }

    /// Record a completed inference on `kind`
    pub fn record_success(&self, kind: SessionKind) {
        let mut h = self.slot(kind).health.lock();
        h.consecutive_errors = 0;
        h.ops_since_cleanup += 1;
        h.last_used = Instant::now();
    }

    /// Record a failed inference; returns the resulting state
    ///
    /// The session degrades on the first error and fails outright after the
    /// configured run of consecutive errors.
    pub fn record_failure(&self, kind: SessionKind) -> SessionState {
        let mut h = self.slot(kind).health.lock();
        h.consecutive_errors += 1;
        if h.consecutive_errors >= self.config.max_consecutive_errors {
            h.state = SessionState::Failed;
            tracing::error!(
                session = kind.label(),
                errors = h.consecutive_errors,
                "Session failed; excluded until lifecycle revival"
            );
        } else if h.state == SessionState::Ready {
            h.state = SessionState::Degraded;
            tracing::warn!(
                session = kind.label(),
                errors = h.consecutive_errors,
                "Session degraded after inference error"
            );
        }
        h.state
    }

    pub fn mark_degraded(&self, kind: SessionKind, reason: &str) {
        let mut h = self.slot(kind).health.lock();
        if h.state == SessionState::Ready {
            h.state = SessionState::Degraded;
            tracing::warn!(session = kind.label(), reason, "Session degraded");
        }
    }

    /// Restore a degraded or failed session to Ready after scoped cleanup
    pub fn recover(&self, kind: SessionKind) {
        let mut h = self.slot(kind).health.lock();
        h.state = SessionState::Ready;
        h.consecutive_errors = 0;
        h.ops_since_cleanup = 0;
        h.last_cleanup = Instant::now();
        tracing::info!(session = kind.label(), "Session recovered");
    }

    /// Whether this session is due for a scoped cleanup on its next idle
    /// transition (op count or wallclock, whichever trips first)
    pub fn needs_cleanup(&self, kind: SessionKind) -> bool {
        let h = self.slot(kind).health.lock();
        h.ops_since_cleanup >= self.config.ops_per_cleanup
            || (h.ops_since_cleanup > 0
                && h.last_cleanup.elapsed().as_secs() >= self.config.cleanup_after_secs)
    }

    /// Run the scoped cleanup: exclusive access, explicit release, recover
    pub async fn scoped_cleanup(&self, kind: SessionKind) -> Result<(), SpeechError> {
        let guard = self.acquire(kind).await?;
        guard.release().await?;
        drop(guard);
        self.recover(kind);
        Ok(())
    }

    pub fn config(&self) -> &PoolSettings {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SilenceSynthesizer;

    fn pool() -> SessionPool {
        let s = || -> Arc<dyn Synthesizer> { Arc::new(SilenceSynthesizer::new(24000)) };
        SessionPool::new(s(), s(), s(), PoolSettings::default())
    }

    #[tokio::test]
    async fn test_acquire_distinct_kinds_do_not_contend() {
        let pool = pool();
        pool.mark_ready(SessionKind::Accelerator);
        pool.mark_ready(SessionKind::Generic);

        let a = pool.acquire(SessionKind::Accelerator).await.unwrap();
        // Holding the accelerator must not block the CPU acquire
        let b = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            pool.acquire(SessionKind::Generic),
        )
        .await
        .expect("cross-kind acquire blocked")
        .unwrap();

        assert_eq!(a.kind(), SessionKind::Accelerator);
        assert_eq!(b.kind(), SessionKind::Generic);
    }

    #[tokio::test]
    async fn test_same_kind_serializes() {
        let pool = Arc::new(pool());
        pool.mark_ready(SessionKind::Generic);

        let g = pool.acquire(SessionKind::Generic).await.unwrap();
        let pool2 = Arc::clone(&pool);
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), async move {
            pool2.acquire(SessionKind::Generic).await
        })
        .await;
        assert!(second.is_err(), "same-kind acquire should wait");
        drop(g);
    }

    #[test]
    fn test_failure_path_degrades_then_fails() {
        let pool = pool();
        pool.mark_ready(SessionKind::Accelerator);

        assert_eq!(
            pool.record_failure(SessionKind::Accelerator),
            SessionState::Degraded
        );
        for _ in 0..3 {
            pool.record_failure(SessionKind::Accelerator);
        }
        assert_eq!(
            pool.record_failure(SessionKind::Accelerator),
            SessionState::Failed
        );
    }

    #[test]
    fn test_success_resets_error_run() {
        let pool = pool();
        pool.mark_ready(SessionKind::Generic);

        for _ in 0..4 {
            pool.record_failure(SessionKind::Generic);
        }
        pool.record_success(SessionKind::Generic);
        // A fresh error run starts from zero
        assert_ne!(
            pool.record_failure(SessionKind::Generic),
            SessionState::Failed
        );
    }

    #[tokio::test]
    async fn test_all_failed_is_unavailable() {
        let pool = pool();
        for kind in SessionKind::ALL {
            pool.mark_ready(kind);
            for _ in 0..5 {
                pool.record_failure(kind);
            }
        }
        let err = pool.acquire(SessionKind::Generic).await.unwrap_err();
        assert!(matches!(err, SpeechError::SessionUnavailable));
    }

    #[tokio::test]
    async fn test_cleanup_counters() {
        let pool = pool();
        pool.mark_ready(SessionKind::Accelerator);
        assert!(!pool.needs_cleanup(SessionKind::Accelerator));

        for _ in 0..50 {
            pool.record_success(SessionKind::Accelerator);
        }
        assert!(pool.needs_cleanup(SessionKind::Accelerator));

        pool.scoped_cleanup(SessionKind::Accelerator).await.unwrap();
        assert!(!pool.needs_cleanup(SessionKind::Accelerator));
        assert_eq!(pool.state(SessionKind::Accelerator), SessionState::Ready);
    }

    #[test]
    fn test_snapshot_ready_counts() {
        let pool = pool();
        pool.mark_ready(SessionKind::Accelerator);
        pool.mark_ready(SessionKind::CoProcessor);
        let snap = pool.snapshot();
        assert_eq!(snap.ready_non_generic(), 2);
        assert!(!snap.is_ready(SessionKind::Generic));
    }
}
