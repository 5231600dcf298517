//! API route handlers.

pub mod jobs;
pub mod results;
pub mod workers;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;
use rqueue_core::Error;

/// API v1 routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/index", get(index))
        .merge(jobs::router())
        .merge(results::router())
        .merge(workers::router())
}

/// Aggregate counts over functions, workers and results.
async fn index(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let functions = state.client.all_functions().await?;
    let workers = state.client.all_workers().await?;
    let results = state.client.all_job_results().await?;
    Ok(Json(json!({
        "functions_num": functions.len(),
        "workers_num": workers.len(),
        "results_num": results.len(),
    })))
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Core errors rendered as JSON with a fitting status code.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Usage(_) => StatusCode::BAD_REQUEST,
            Error::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("request failed: {}", self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
