use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;
use rqueue_core::{Client, Error, Result};

/// Run the introspection HTTP service until the listener fails.
pub async fn run(client: Client, host: &str, port: u16) -> Result<()> {
    let addr = SocketAddr::from((
        host.parse::<std::net::IpAddr>()
            .map_err(|e| Error::Config(format!("invalid host: {}", e)))?,
        port,
    ));

    let app = build_router(AppState::new(client));

    info!("rqueue introspection server listening on http://{}", addr);
    log_routes();

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;
    axum::serve(listener, app).await.map_err(Error::Io)?;
    Ok(())
}

/// Build the router: health + banner at the root, the read-only API under
/// `/api/v1`.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
        .nest("/api/v1", crate::routes::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn log_routes() {
    info!("Available routes:");
    info!("  GET  /health                        - Liveness");
    info!("  GET  /                              - Service banner");
    info!("  GET  /api/v1/index                  - Aggregate counts");
    info!("  GET  /api/v1/workers                - Worker records");
    info!("  GET  /api/v1/functions              - Function registry");
    info!("  GET  /api/v1/results                - Job results (worker/function/job_id filters)");
    info!("  GET  /api/v1/queued_jobs            - Queue contents");
    info!("  GET  /api/v1/jobs/:job_id/status    - Job status");
    info!("  GET  /api/v1/health_check           - Per-worker health");
}

async fn health_check() -> &'static str {
    "OK"
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "rqueue introspection API",
        "version": rqueue_core::VERSION,
        "status": "operational",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rqueue_core::RedisSettings;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await;
        assert_eq!(response, "OK");
    }

    #[tokio::test]
    async fn test_router_serves_health_and_index() {
        // needs a reachable redis; skipped silently otherwise
        let settings = RedisSettings {
            conn_retries: 0,
            ..Default::default()
        };
        if let Ok(client) = Client::connect(&settings).await {
            let app = build_router(AppState::new(client));

            let response = app
                .clone()
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let response = app
                .clone()
                .oneshot(Request::builder().uri("/api/v1/index").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/api/v1/health_check?worker_name=no-such-worker")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }
}
