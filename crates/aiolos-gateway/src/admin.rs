//! Admin HTTP endpoint: liveness and outcome counters.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::stats::GatewayStats;

pub fn router(stats: Arc<GatewayStats>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/stats", get(handle_get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(stats)
}

/// Serve the admin router until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    stats: Arc<GatewayStats>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(stats))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /api/stats
async fn handle_get_stats(State(stats): State<Arc<GatewayStats>>) -> impl IntoResponse {
    Json(stats.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Outcome;

    async fn start(stats: Arc<GatewayStats>) -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, stats, async move {
            let _ = stopped.await;
        }));
        (base, stop)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (base, _stop) = start(Arc::new(GatewayStats::new())).await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn stats_reports_snapshot() {
        let stats = Arc::new(GatewayStats::new());
        stats.record(Outcome::Accepted);
        stats.record(Outcome::ForwardFailure);
        let (base, _stop) = start(stats.clone()).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/api/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["total_requests"], 2);
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["forward_failure"], 1);
    }
}
