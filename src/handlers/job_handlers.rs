use crate::{errors::AppError, models::job::Job, routes::routes::AppState};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub plan_id: Option<Uuid>,
}

/// `GET /v1/jobs?planId=...`
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    Ok(Json(state.plans.list_jobs(query.plan_id).await?))
}

/// `GET /v1/jobs/{id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.plans.get_job(id).await?))
}
