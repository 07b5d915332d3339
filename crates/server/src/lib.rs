//! HTTP synthesis server for lyra
//!
//! Loopback REST API over the streaming engine, plus the WebSocket client
//! that forwards chunk streams to the playback daemon.

pub mod daemon_client;
pub mod http;
pub mod state;

pub use daemon_client::{DaemonClient, PlayOutcome};
pub use http::create_router;
pub use state::AppState;
