//! Synthesis server entry point

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lyra_config::{load_settings, Settings};
use lyra_core::{GenericProbe, Synthesizer};
use lyra_engine::{Engine, EngineBackends, ToneSynthesizer};
use lyra_server::{create_router, AppState, DaemonClient};

#[tokio::main]
async fn main() -> ExitCode {
    let env = std::env::var("LYRA_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(2);
        },
    };

    init_tracing(&settings);
    tracing::info!("Starting lyra server v{}", env!("CARGO_PKG_VERSION"));

    match run(settings).await {
        Ok(()) => {
            tracing::info!("Server shutdown complete");
            ExitCode::SUCCESS
        },
        Err(e) => {
            tracing::error!(error = %e, "Fatal server error");
            ExitCode::FAILURE
        },
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("Initialized Prometheus metrics at /metrics");

    let engine = Engine::new(settings.clone(), build_backends(&settings)?);

    // Fast-ready gate: one warm inference, deep warming in the background
    engine.start().await.map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!("Engine ready");

    let daemon_url = format!(
        "ws://{}:{}/ws",
        settings.daemon.host, settings.daemon.port
    );
    let state = AppState::new(Arc::clone(&engine))
        .with_metrics(metrics_handle)
        .with_daemon(Arc::new(DaemonClient::new(daemon_url)));

    let app = create_router(state);
    let host: std::net::IpAddr = settings.server.host.parse()?;
    let addr = SocketAddr::from((host, settings.server.port));
    tracing::info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

/// Assemble the three session backends
///
/// With a model configured (and the `onnx` feature), each slot gets its own
/// session so the pool's exclusivity is per-placement. Model-less builds
/// run the deterministic tone backend in every slot.
fn build_backends(settings: &Settings) -> anyhow::Result<EngineBackends> {
    #[cfg(feature = "onnx")]
    if let Some(path) = &settings.models.synthesizer_path {
        use lyra_engine::synth::{create_synthesizer, BackendKind};
        let path = std::path::Path::new(path);
        let make = || create_synthesizer(BackendKind::Onnx, 24000, Some(path));
        let accelerator = make().map_err(|e| anyhow::anyhow!(e))?;
        let coprocessor = make().map_err(|e| anyhow::anyhow!(e))?;
        let generic = make().map_err(|e| anyhow::anyhow!(e))?;
        tracing::info!(model = %path.display(), "ONNX synthesizer sessions loaded");
        return Ok(EngineBackends {
            accelerator,
            coprocessor,
            generic,
            probe: Arc::new(GenericProbe),
            g2p: None,
        });
    }

    if settings.models.synthesizer_path.is_some() {
        tracing::warn!("Synthesizer model configured but the onnx feature is off; using tones");
    } else {
        tracing::warn!("No synthesizer model configured; using deterministic tone backend");
    }

    let tone = || -> Arc<dyn Synthesizer> { Arc::new(ToneSynthesizer::new(24000)) };
    Ok(EngineBackends {
        accelerator: tone(),
        coprocessor: tone(),
        generic: tone(),
        probe: Arc::new(GenericProbe),
        g2p: None,
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("lyra={},tower_http=warn", settings.observability.log_level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
