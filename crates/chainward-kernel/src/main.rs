//! Chainward engine binary.
//!
//! - Processing stream: /v1/ext_proc (one WebSocket per HTTP exchange)
//! - Distribution stream: /v1/discovery
//! - Admin: /v1/admin/*, ops: /healthz /readyz /metrics
//!
//! Usage: `chainward [config.yaml]` (default `chainward.yaml`).

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainward_core::error::EngineError;
use chainward_kernel::{app_state::AppState, config, router};

#[derive(Debug, Error)]
enum BootError {
    #[error(transparent)]
    Config(#[from] EngineError),
    #[error("server.listen `{0}` is not a socket address")]
    Addr(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "chainward failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BootError> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "chainward.yaml".into());
    let cfg = config::load_from_file(&path)?;
    let listen: SocketAddr = cfg
        .server
        .listen
        .parse()
        .map_err(|_| BootError::Addr(cfg.server.listen.clone()))?;
    let drain_grace = Duration::from_millis(cfg.server.drain_grace_ms);

    let state = AppState::new(cfg)?;
    let cancel = CancellationToken::new();
    let tasks = state.spawn_background(cancel.clone());
    let app = router::build_router(state.clone());

    tracing::info!(%listen, config = %path, "chainward starting");
    let listener = tokio::net::TcpListener::bind(listen).await?;

    let draining = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.set_draining();
            tracing::info!(grace_ms = drain_grace.as_millis() as u64, "draining");
            tokio::time::sleep(drain_grace).await;
        })
        .await?;

    cancel.cancel();
    for t in tasks {
        let _ = t.await;
    }
    tracing::info!("chainward stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("signal received, starting graceful shutdown");
}
