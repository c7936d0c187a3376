//! HTTP API for flowtop
//!
//! A minimal surface: a health endpoint for liveness probes.

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn health() -> &'static str {
    "ok\n"
}

pub fn router() -> Router {
    Router::new().route("/api/v1/health", get(health))
}

/// Serve until cancellation.
pub async fn serve(addr: &str, port: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let bind = format!("{}:{}", addr, port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("start http server on {}", bind);

    axum::serve(listener, router())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("http server exit");
    Ok(())
}
