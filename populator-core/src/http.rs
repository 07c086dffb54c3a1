use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::metrics::REGISTRY;

/// Serves the Prometheus registry until cancelled.
pub(crate) async fn serve(addr: SocketAddr, path: String, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {addr}");

    let app = Router::new().route(&path, get(render));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn render() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap();
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(()) => buffer,
        Err(_) => String::new(),
    }
}
