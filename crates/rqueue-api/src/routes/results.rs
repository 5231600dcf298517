//! Stored job results.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    /// Only results produced by this worker
    pub worker: Option<String>,

    /// Only results of this function
    pub function: Option<String>,

    /// Only the result with this identity
    pub job_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/results", get(all_results))
}

/// Every stored result, sorted by enqueue time, optionally filtered.
async fn all_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<Value>> {
    let mut results = state.client.all_job_results().await?;
    if let Some(worker) = &query.worker {
        results.retain(|r| &r.worker_name == worker);
    }
    if let Some(function) = &query.function {
        results.retain(|r| &r.function == function);
    }
    if let Some(job_id) = &query.job_id {
        results.retain(|r| r.job_id.as_ref() == Some(job_id));
    }
    Ok(Json(json!({ "results": results })))
}
