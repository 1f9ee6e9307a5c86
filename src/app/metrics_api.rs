//! Prometheus metrics HTTP endpoint
//!
//! Serves `/metrics` for Prometheus scraping when `experimental.metrics_listen`
//! is set.

use std::net::SocketAddr;

use axum::{http::header::CONTENT_TYPE, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use super::metrics::{init_metrics, REGISTRY};
use crate::error::Result;

async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("[metrics] encode failed: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

pub fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(get_metrics))
}

/// Bind the metrics listener; serving starts with [`serve_metrics`]
pub async fn bind_metrics(addr: SocketAddr) -> Result<TcpListener> {
    init_metrics();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::Error::from(e).cause(format!("listen metrics {}", addr)))?;
    info!(
        "[metrics] listening on http://{}/metrics",
        listener.local_addr()?
    );
    Ok(listener)
}

/// Serve until `shutdown` flips to true
pub async fn serve_metrics(listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    axum::serve(listener, build_metrics_router())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("[metrics] shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("[metrics] server error: {}", e);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::metrics::ROUTER_DECISIONS_TOTAL;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let listener = bind_metrics("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        ROUTER_DECISIONS_TOTAL.inc();

        let (stop, shutdown) = watch::channel(false);
        let server = tokio::spawn(serve_metrics(listener, shutdown));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("flowgate_router_decisions_total"));

        stop.send_replace(true);
        server.await.unwrap();
    }
}
