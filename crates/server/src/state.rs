//! Application State
//!
//! Shared state across all handlers. The engine owns every piece of
//! mutable synthesis state; the server only holds handles.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

use lyra_engine::Engine;

use crate::daemon_client::DaemonClient;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub started: Arc<Instant>,
    pub metrics_handle: Option<PrometheusHandle>,
    /// Client to the local playback daemon; `None` when requests only
    /// stream over HTTP
    pub daemon: Option<Arc<DaemonClient>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started: Arc::new(Instant::now()),
            metrics_handle: None,
            daemon: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn with_daemon(mut self, daemon: Arc<DaemonClient>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
