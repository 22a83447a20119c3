//! Liveness endpoint for the kubelet.

use axum::{
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/healthcheck", get(healthz))
}

/// Serves the health endpoints on `listen` until `stop` is cancelled.
pub async fn run_health_server(listen: SocketAddr, stop: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("Listening for health checks on {listen}");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
}

async fn healthz() -> &'static str {
    trace!("health check");
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn healthz_returns_ok() {
        assert_eq!(healthz().await, "ok");
    }

    #[tokio::test]
    async fn server_stops_on_cancel() {
        let stop = CancellationToken::new();
        let server = tokio::spawn(run_health_server("127.0.0.1:0".parse().unwrap(), stop.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("health server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
