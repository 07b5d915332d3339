//! HTTP Endpoints
//!
//! Loopback REST API for synthesis. Streaming responses are chunked bodies
//! that begin with a WAV header (placeholder sizes) and ~50 ms of silence,
//! then PCM frames as inference produces them.

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use lyra_core::{wav, AudioFormat, SpeechError};
use lyra_engine::{SpeakRequest, StreamEvent};

use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/speak", post(speak))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Payload container for the synthesis endpoint
#[derive(Debug, Deserialize)]
struct SpeakBody {
    text: String,
    #[serde(default = "default_voice")]
    voice: String,
    #[serde(default = "default_speed")]
    speed: f32,
    #[serde(default = "default_lang")]
    lang: String,
    #[serde(default = "default_true")]
    stream: bool,
    #[serde(default)]
    format: WireFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
enum WireFormat {
    #[default]
    Wav,
    Pcm,
}

fn default_voice() -> String {
    "af_heart".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_lang() -> String {
    "en-us".to_string()
}

fn default_true() -> bool {
    true
}

/// Synthesis endpoint
async fn speak(State(state): State<AppState>, Json(body): Json<SpeakBody>) -> Response {
    let wire = body.format;
    let request = SpeakRequest {
        text: body.text,
        voice: body.voice,
        speed: body.speed,
        lang: body.lang,
        format: AudioFormat::default(),
    };

    let handle = match state.engine.speak(request) {
        Ok(h) => h,
        Err(e) => return error_response(e),
    };

    if body.stream {
        stream_response(handle, wire)
    } else {
        collect_response(handle, wire).await
    }
}

/// Chunked streaming body straight off the scheduler
fn stream_response(handle: lyra_engine::UtteranceHandle, wire: WireFormat) -> Response {
    let stream = futures::stream::unfold(handle, move |mut handle| async move {
        loop {
            match handle.next().await {
                Some(StreamEvent::Chunk(chunk)) => {
                    // The raw-PCM wire format drops the WAV header chunk
                    if wire == WireFormat::Pcm && chunk.seq == 0 {
                        continue;
                    }
                    if chunk.bytes.is_empty() {
                        continue;
                    }
                    return Some((
                        Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(chunk.bytes)),
                        handle,
                    ));
                },
                Some(StreamEvent::Error { segment_id, message }) => {
                    // Mid-stream failure: the body has already terminated
                    // with the last good chunk; log the control-side marker
                    tracing::error!(?segment_id, message, "Utterance ended with error");
                },
                Some(StreamEvent::Finished { .. }) => {},
                None => return None,
            }
        }
    });

    let content_type = match wire {
        WireFormat::Wav => "audio/wav",
        WireFormat::Pcm => "application/octet-stream",
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Non-streamed: collect, then return one well-formed payload
async fn collect_response(mut handle: lyra_engine::UtteranceHandle, wire: WireFormat) -> Response {
    let mut payload: Vec<u8> = Vec::new();
    let mut failure: Option<(Option<u32>, String)> = None;

    while let Some(event) = handle.next().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                // Envelope header is rebuilt with real sizes below
                if chunk.seq == 0 {
                    continue;
                }
                payload.extend_from_slice(&chunk.bytes);
            },
            StreamEvent::Error { segment_id, message } => {
                failure = Some((segment_id, message));
            },
            StreamEvent::Finished { .. } => {},
        }
    }

    if let Some((segment_id, message)) = failure {
        tracing::error!(?segment_id, message, "Synthesis failed");
        return error_response(SpeechError::SynthesisFailed {
            segment_id: segment_id.unwrap_or_default(),
            reason: message,
        });
    }

    let (content_type, body) = match wire {
        WireFormat::Wav => {
            let mut out = wav::finalized_header(AudioFormat::default(), payload.len() as u32);
            out.extend_from_slice(&payload);
            ("audio/wav", out)
        },
        WireFormat::Pcm => ("application/octet-stream", payload),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(e: SpeechError) -> Response {
    let status = match &e {
        SpeechError::InputInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SpeechError::SessionUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        SpeechError::Cancelled => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({ "error": e.to_string() });
    (status, Json(body)).into_response()
}

/// Liveness
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.uptime_secs(),
        "ready": state.engine.ready(),
    }))
}

/// Readiness; gated on the lifecycle warmup
async fn readiness_check(State(state): State<AppState>) -> Response {
    if state.engine.ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "warming").into_response()
    }
}

/// Prometheus metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
