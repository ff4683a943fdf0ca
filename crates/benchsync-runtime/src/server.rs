//! HTTP server lifecycle: bind, serve, and drain on shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::api;
use crate::service::{ServiceConfig, SyncService};

/// Open the database, bind `addr`, and serve until ctrl-c or SIGTERM.
pub async fn run_server(addr: SocketAddr, db: &Path, config: ServiceConfig) -> anyhow::Result<()> {
    let service = Arc::new(SyncService::open(db, config)?);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {addr}: {e}"))?;

    serve(listener, service, shutdown_signal()).await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Serve the API on an already-bound listener until `shutdown` resolves.
/// In-flight requests are allowed to finish.
pub async fn serve<F>(
    listener: TcpListener,
    service: Arc<SyncService>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("listening on http://{addr}");
    }
    axum::serve(listener, api::router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}
