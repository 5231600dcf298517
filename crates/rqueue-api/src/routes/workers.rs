//! Worker records, the function registry and per-worker health.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/workers", get(all_workers))
        .route("/functions", get(all_functions))
        .route("/health_check", get(health_check))
}

async fn all_workers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let workers = state.client.all_workers().await?;
    Ok(Json(json!({ "workers": workers })))
}

async fn all_functions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let functions = state.client.all_functions().await?;
    Ok(Json(json!({ "functions": functions })))
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub worker_name: String,
}

/// Health counters for one worker, 404 when the record is missing or
/// stale.
async fn health_check(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Response> {
    match state.client.health_check(&query.worker_name).await? {
        Some(raw) => {
            let parsed: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            Ok(Json(json!({ "result": parsed })).into_response())
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("no health record for worker '{}'", query.worker_name)
            })),
        )
            .into_response()),
    }
}
