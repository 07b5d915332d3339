//! Playback daemon entry point

use std::net::SocketAddr;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lyra_config::{load_settings, Settings};
use lyra_daemon::{create_router, DaemonState};

#[tokio::main]
async fn main() -> ExitCode {
    let env = std::env::var("LYRA_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized; exit code 2 is the config-error
            // contract
            eprintln!("Configuration error: {e}");
            return ExitCode::from(2);
        },
    };

    init_tracing(&settings);

    tracing::info!("Starting lyra playback daemon v{}", env!("CARGO_PKG_VERSION"));

    match run(settings).await {
        Ok(()) => {
            tracing::info!("Daemon shutdown complete");
            ExitCode::SUCCESS
        },
        Err(e) => {
            tracing::error!(error = %e, "Fatal daemon error");
            ExitCode::FAILURE
        },
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let host: std::net::IpAddr = settings.daemon.host.parse()?;
    let addr = SocketAddr::from((host, settings.daemon.port));

    let state = DaemonState::new(settings);
    let app = create_router(state);

    tracing::info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
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
