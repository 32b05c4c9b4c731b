//! HTTP handlers for plan management and on-demand runs.

use crate::{
    errors::AppError,
    models::plan::{Plan, PlanUpdate},
    routes::routes::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlanResponse {
    pub job_id: Uuid,
}

/// `POST /v1/plans`
pub async fn create_plan(
    State(state): State<AppState>,
    Json(plan): Json<Plan>,
) -> Result<impl IntoResponse, AppError> {
    let plan = state.plans.create(plan).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// `GET /v1/plans`
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<Plan>>, AppError> {
    Ok(Json(state.plans.list().await?))
}

/// `GET /v1/plans/{id}`
pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Plan>, AppError> {
    Ok(Json(state.plans.get(id).await?))
}

/// `PUT /v1/plans/{id}` with only the fields to change.
pub async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<PlanUpdate>,
) -> Result<Json<Plan>, AppError> {
    Ok(Json(state.plans.update(id, update).await?))
}

/// `DELETE /v1/plans/{id}`; deleting twice is fine.
pub async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.plans.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/plans/{id}/run`
///
/// Answers as soon as the job exists; the transfer happens on a worker.
pub async fn run_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = state.plans.run(id).await?;
    Ok((StatusCode::ACCEPTED, Json(RunPlanResponse { job_id })))
}
