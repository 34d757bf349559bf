use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use sluice_core::prelude::*;

use super::pipeline::StatusQuery;
use crate::{
    control::{self, Jobs},
    error::ApiError,
    ApiContextRef,
};

/// Jobs have no prepare, pause, resume, cleanup or sniff verbs
pub fn router() -> Router<ApiContextRef> {
    Router::new()
        .route("/", get(list))
        .route("/detailed", get(list_detailed))
        .route("/add", put(add))
        .route("/start/{run_id}", get(start))
        .route("/stop/{run_id}", get(stop))
        .route("/status/{run_id}", get(status))
        .route("/log/{run_id}", get(log))
        .route("/log/{run_id}/{from}", get(log_from))
        .route("/remove/{run_id}", get(remove))
}

async fn list(State(context): State<ApiContextRef>) -> Json<Vec<RunEntry>> {
    Json(control::list::<Jobs>(&context))
}

async fn list_detailed(State(context): State<ApiContextRef>) -> Json<Vec<ExecutionStatus>> {
    Json(control::list_detailed::<Jobs>(&context))
}

async fn add(
    State(context): State<ApiContextRef>,
    payload: Result<Json<JobConfiguration>, JsonRejection>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    let Json(configuration) =
        payload.map_err(|e| ApiError::InvalidConfiguration(e.body_text()))?;

    control::submit::<Jobs>(&context, configuration)
        .await
        .map(Json)
}

async fn start(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    control::start::<Jobs>(&context, &run_id).await.map(Json)
}

async fn stop(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    control::stop::<Jobs>(&context, &run_id).await.map(Json)
}

async fn status(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    control::status::<Jobs>(&context, &run_id, query.from).map(Json)
}

async fn log(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<String, ApiError> {
    control::log::<Jobs>(&context, &run_id, 0)
}

async fn log_from(
    State(context): State<ApiContextRef>,
    Path((run_id, from)): Path<(String, u64)>,
) -> Result<String, ApiError> {
    control::log::<Jobs>(&context, &run_id, from)
}

async fn remove(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<WebResult>, ApiError> {
    control::remove::<Jobs>(&context, &run_id).await.map(Json)
}
