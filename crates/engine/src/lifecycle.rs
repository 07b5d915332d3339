//! Warmup and lifecycle management
//!
//! Readiness gates on a minimal warmup: exactly one short inference on the
//! preferred session, run synchronously. Deeper warming (remaining
//! sessions, pattern coverage, primer priming, temp-file cleanup) moves to
//! a background task. A periodic keep-alive keeps accelerator context
//! resident, and scoped cleanups bound long-running context leaks.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use lyra_config::LifecycleSettings;
use lyra_core::{HardwareProbe, SpeechError};

use crate::pool::{SessionKind, SessionPool, SessionState};

/// Warmup pattern; one in-flight warmup per (session, pattern)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarmPattern {
    /// Trivial short inference
    Short,
    /// Keep-alive ping
    KeepAlive,
}

/// Lifecycle manager
pub struct LifecycleManager {
    pool: Arc<SessionPool>,
    probe: Arc<dyn HardwareProbe>,
    config: LifecycleSettings,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    /// Collapses duplicate warmup intents across scheduler, background
    /// warming and keep-alive
    inflight: DashMap<(SessionKind, WarmPattern), ()>,
    last_request: Mutex<Instant>,
}

impl LifecycleManager {
    pub fn new(
        pool: Arc<SessionPool>,
        probe: Arc<dyn HardwareProbe>,
        config: LifecycleSettings,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pool,
            probe,
            config,
            ready_tx,
            ready_rx,
            shutdown_tx,
            inflight: DashMap::new(),
            last_request: Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(3600))
                    .unwrap_or_else(Instant::now),
            ),
        }
    }

    /// Preferred session for the synchronous warmup
    fn preferred_kind(&self) -> SessionKind {
        if self.probe.probe().has_accelerator {
            SessionKind::Accelerator
        } else {
            SessionKind::Generic
        }
    }

    /// Fast-ready gate: one short inference on the preferred session, then
    /// declare ready; deep warming continues in the background
    pub async fn start(self: &Arc<Self>) -> Result<(), SpeechError> {
        let started = Instant::now();

        if self.config.enable_cold_start_warmup {
            let kind = self.preferred_kind();
            self.warm_session(kind, WarmPattern::Short).await?;
            tracing::info!(
                session = kind.label(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Minimal warmup complete"
            );
        } else {
            // No warmup requested; sessions go Ready cold and pay the cost
            // on first use
            for kind in SessionKind::ALL {
                self.pool.mark_ready(kind);
            }
            tracing::info!("Cold-start warmup disabled; sessions marked ready cold");
        }

        let _ = self.ready_tx.send(true);

        if self.config.defer_background_init {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.deep_warm().await;
            });
        } else {
            self.deep_warm().await;
        }

        if self.config.keep_alive_enabled {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.keep_alive_loop().await;
            });
        }

        Ok(())
    }

    pub fn ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Note request activity; suppresses the next keep-alive tick
    pub fn note_request(&self) {
        *self.last_request.lock() = Instant::now();
    }

    /// Should optional work be skipped right now?
    pub fn pressure_hint(&self) -> bool {
        let report = self.probe.probe();
        report.memory_mb < self.config.memory_threshold_mb
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.ready_tx.send(false);
        tracing::info!("Lifecycle shutdown");
    }

    /// Warm one session; duplicate intents for the same (session, pattern)
    /// collapse onto the winner
    pub async fn warm_session(
        &self,
        kind: SessionKind,
        pattern: WarmPattern,
    ) -> Result<(), SpeechError> {
        if self.inflight.insert((kind, pattern), ()).is_some() {
            tracing::debug!(session = kind.label(), "Warmup already in flight; skipping");
            return Ok(());
        }

        let result = async {
            if self.pool.state(kind) == SessionState::Failed {
                // Revival path: a warm inference is how a failed session
                // earns its way back
                tracing::info!(session = kind.label(), "Attempting failed-session revival");
            }
            self.pool.mark_warming(kind);
            let guard = self.pool.acquire(kind).await?;
            guard.warm().await?;
            drop(guard);
            self.pool.mark_ready(kind);
            Ok(())
        }
        .await;

        self.inflight.remove(&(kind, pattern));

        if let Err(ref e) = result {
            tracing::warn!(session = kind.label(), error = %e, "Warmup failed");
        }
        result
    }

    /// Deferred deep warming: remaining sessions, optional primer priming,
    /// startup temp cleanup
    async fn deep_warm(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let preferred = self.preferred_kind();

        if !self.config.minimal_warmup {
            for kind in SessionKind::ALL {
                if kind == preferred || *shutdown.borrow() {
                    continue;
                }
                if self.pressure_hint() {
                    tracing::debug!("Pressure hint set; skipping deep session warming");
                    break;
                }
                let _ = self.warm_session(kind, WarmPattern::Short).await;
            }
        } else {
            // Minimal mode still brings the CPU slot up so the selector has
            // a fallback; accelerated slots warm on demand
            if preferred != SessionKind::Generic {
                let _ = self.warm_session(SessionKind::Generic, WarmPattern::Short).await;
            }
        }

        if !self.config.skip_startup_cleanup {
            if let Err(e) = clean_stale_temp_files().await {
                tracing::debug!(error = %e, "Startup temp cleanup failed (non-fatal)");
            }
        }

        if self.config.priming_mode {
            tracing::info!("Priming mode set; primer cache will be seeded by first requests");
        }

        tracing::debug!("Deep warming complete");
    }

    /// Periodic trivial synthesis to every Ready session, skipped while
    /// requests are flowing
    async fn keep_alive_loop(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let base = Duration::from_secs(self.config.keep_alive_interval_s.max(1));

        loop {
            // Jitter keeps multiple instances from aligning their pings
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
            tokio::select! {
                _ = tokio::time::sleep(base + jitter) => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                },
            }

            let idle_for = self.last_request.lock().elapsed();
            if idle_for < Duration::from_secs(lyra_config::constants::lifecycle::KEEP_ALIVE_SUPPRESS_SECS)
            {
                tracing::trace!("Keep-alive suppressed; recent request activity");
                continue;
            }

            for kind in SessionKind::ALL {
                if self.pool.state(kind) == SessionState::Ready {
                    let _ = self.warm_session(kind, WarmPattern::KeepAlive).await;
                }
            }
            metrics::counter!("lyra_keep_alive_ticks_total").increment(1);
        }
    }
}

/// Remove stale synthesis scratch files left by earlier runs
async fn clean_stale_temp_files() -> std::io::Result<()> {
    clean_stale_temp_files_in(&std::env::temp_dir()).await
}

async fn clean_stale_temp_files_in(dir: &std::path::Path) -> std::io::Result<()> {
    let mut removed = 0usize;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("lyra-scratch-") {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        tracing::info!(removed, "Removed stale scratch files");
    }
    Ok(())
}
