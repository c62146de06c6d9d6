//! MCP sidecar service entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use archon_sidecar::{router, AppState, SidecarSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl+C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = SidecarSettings::from_env();
    let state = Arc::new(AppState::from_settings(&settings).context("backend selection failed")?);

    // Periodic reconcile keeps tracking fresh between status calls and
    // rehydrates workloads created by a previous incarnation.
    let reconcile = state.supervisor.spawn_reconcile_loop();

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", settings.host, settings.port))?;

    info!(%addr, namespace = %settings.supervisor.namespace, "MCP sidecar listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Workers outlive the sidecar; tracking rehydrates from pod
    // annotations on the next start. Open exec channels do not.
    reconcile.abort();
    let cleanup = state.supervisor.config().cleanup_timeout;
    if tokio::time::timeout(cleanup, state.supervisor.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("cleanup timed out, dropping remaining sessions");
    }
    info!("MCP sidecar shutdown complete");
    Ok(())
}
