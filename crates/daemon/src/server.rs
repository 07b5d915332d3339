//! Daemon HTTP/WebSocket server
//!
//! Accepts any number of concurrent clients; each runs on its own task
//! group. Malformed JSON is logged and ignored without dropping the
//! connection; unknown frame types get an `error` control frame.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use lyra_config::Settings;

use crate::client::{ClientSession, PlayState};
use crate::protocol::{ClientFrame, ErrorData, ServerFrame};

/// Shared daemon state
#[derive(Clone)]
pub struct DaemonState {
    pub settings: Arc<Settings>,
    started: Arc<Instant>,
    sessions: Arc<Mutex<HashMap<Uuid, Arc<ClientSession>>>>,
}

impl DaemonState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            started: Arc::new(Instant::now()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn any_sink_active(&self) -> bool {
        self.sessions.lock().values().any(|s| {
            matches!(
                s.state(),
                PlayState::Playing | PlayState::Paused | PlayState::EndingStream
            )
        })
    }
}

/// Build the daemon router
pub fn create_router(state: DaemonState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness endpoint
async fn health(State(state): State<DaemonState>) -> Json<serde_json::Value> {
    let audio_processor = if state.any_sink_active() {
        "active"
    } else {
        "idle"
    };
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started.elapsed().as_secs(),
        "clients": state.client_count(),
        "audioProcessor": audio_processor,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DaemonState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: DaemonState) {
    metrics::counter!("lyra_daemon_connections_total").increment(1);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);
    let session = ClientSession::new(state.settings.daemon.clone(), out_tx);
    state
        .sessions
        .lock()
        .insert(session.id, Arc::clone(&session));

    tracing::info!(client = %session.id, "Client connected");

    // Writer task: serialize outbound frames
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!(error = %e, "Frame serialization failed");
                    continue;
                },
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader loop
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatch_text(&session, &text).await;
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {},
            Ok(Message::Binary(_)) => {
                // The protocol is JSON-framed; binary is unexpected but not
                // fatal
                tracing::debug!(client = %session.id, "Ignoring binary frame");
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(client = %session.id, error = %e, "WebSocket error");
                break;
            },
        }
    }

    session.close().await;
    writer.abort();
    state.sessions.lock().remove(&session.id);
    tracing::info!(client = %session.id, "Client disconnected");
}

async fn dispatch_text(session: &Arc<ClientSession>, text: &str) {
    // Malformed JSON: log and ignore, keep the connection
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(client = %session.id, error = %e, "Malformed frame ignored");
            return;
        },
    };

    // Valid JSON with an unknown or missing type: answer with an error frame
    let frame: ClientFrame = match serde_json::from_value(value.clone()) {
        Ok(f) => f,
        Err(_) => {
            let kind = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>");
            tracing::debug!(client = %session.id, kind, "Unknown frame type");
            session
                .send_error(ErrorData {
                    code: "unknown_type".to_string(),
                    message: format!("unknown message type: {kind}"),
                    expected_seq: None,
                })
                .await;
            return;
        },
    };

    session.handle_frame(frame).await;
}
