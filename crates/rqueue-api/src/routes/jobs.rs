//! Queue contents and per-job status.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    /// Queue to inspect, defaults to the client's default queue
    pub queue_name: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queued_jobs", get(queued_jobs))
        .route("/jobs/:job_id/status", get(job_status))
}

/// Definitions currently in the queue index, each with its score and the
/// derived status.
async fn queued_jobs(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Json<Value>> {
    let queue_name = query.queue_name.as_deref();
    let defs = state.client.queued_jobs(queue_name).await?;

    let mut jobs = Vec::with_capacity(defs.len());
    for def in defs {
        let status = match &def.job_id {
            Some(job_id) => Some(state.client.job(job_id.clone(), queue_name).status().await?),
            None => None,
        };
        jobs.push(json!({
            "job": def,
            "state": status,
        }));
    }
    Ok(Json(json!({ "queued_jobs": jobs })))
}

/// Status and definition of one job.
async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Json<Value>> {
    let job = state.client.job(job_id.clone(), query.queue_name.as_deref());
    let status = job.status().await?;
    let info = job.info().await?;
    Ok(Json(json!({
        "job_id": job_id,
        "status": status,
        "info": info,
    })))
}
