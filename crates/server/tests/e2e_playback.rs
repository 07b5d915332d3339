//! Engine -> daemon client -> daemon -> sink, end to end over a real socket

use std::sync::Arc;

use lyra_config::Settings;
use lyra_core::{AudioFormat, GenericProbe, Synthesizer};
use lyra_daemon::{create_router as daemon_router, DaemonState};
use lyra_engine::{Engine, EngineBackends, SpeakRequest, ToneSynthesizer};
use lyra_server::{DaemonClient, PlayOutcome};

/// Settings with a `cat` sink so playback needs no audio hardware
fn daemon_settings() -> Settings {
    let mut settings = Settings::default();
    settings.daemon.sink_command = "cat".to_string();
    settings.daemon.sink_args = vec![];
    settings
}

async fn spawn_daemon() -> String {
    let state = DaemonState::new(daemon_settings());
    let app = daemon_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn tone_engine() -> Arc<Engine> {
    let tone = || -> Arc<dyn Synthesizer> { Arc::new(ToneSynthesizer::new(24000)) };
    let mut settings = Settings::default();
    settings.lifecycle.keep_alive_enabled = false;
    settings.lifecycle.defer_background_init = false;
    settings.lifecycle.minimal_warmup = false;
    let engine = Engine::new(
        settings,
        EngineBackends {
            accelerator: tone(),
            coprocessor: tone(),
            generic: tone(),
            probe: Arc::new(GenericProbe),
            g2p: None,
        },
    );
    engine.start().await.unwrap();
    engine
}

#[tokio::test(flavor = "multi_thread")]
async fn utterance_plays_to_completion_through_daemon() {
    let url = spawn_daemon().await;
    let engine = tone_engine().await;
    let client = DaemonClient::new(url);

    let handle = engine
        .speak(SpeakRequest {
            text: "Hello from the end to end test.".to_string(),
            ..Default::default()
        })
        .unwrap();

    let outcome = client.play(handle, AudioFormat::default()).await.unwrap();
    assert_eq!(outcome, PlayOutcome::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_utterances_back_to_back_each_complete_once() {
    let url = spawn_daemon().await;
    let engine = tone_engine().await;
    let client = DaemonClient::new(url);

    for text in ["First utterance.", "Second utterance."] {
        let handle = engine
            .speak(SpeakRequest {
                text: text.to_string(),
                ..Default::default()
            })
            .unwrap();
        let outcome = client.play(handle, AudioFormat::default()).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Completed);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_utterance_reports_cancelled() {
    let url = spawn_daemon().await;
    let engine = tone_engine().await;
    let client = DaemonClient::new(url);

    let handle = engine
        .speak(SpeakRequest {
            text: "A longer piece of text that will be cancelled. ".repeat(40),
            ..Default::default()
        })
        .unwrap();
    handle.cancel();

    let outcome = client.play(handle, AudioFormat::default()).await.unwrap();
    assert_eq!(outcome, PlayOutcome::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_health_reports_clients() {
    let state = DaemonState::new(daemon_settings());
    assert_eq!(state.client_count(), 0);
}
