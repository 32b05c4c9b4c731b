use crate::{
    errors::AppError, models::policy::Policy, routes::routes::AppState,
    services::plan_service::PlanError,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

/// `POST /v1/policies`
pub async fn create_policy(
    State(state): State<AppState>,
    Json(policy): Json<Policy>,
) -> Result<impl IntoResponse, AppError> {
    let policy = state.plans.create_policy(policy).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

/// `GET /v1/policies`
pub async fn list_policies(State(state): State<AppState>) -> Result<Json<Vec<Policy>>, AppError> {
    Ok(Json(state.plans.list_policies().await?))
}

/// `GET /v1/policies/{id}`
pub async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Policy>, AppError> {
    match state.plans.get_policy(id).await {
        Ok(policy) => Ok(Json(policy)),
        // Direct lookups report 404, not a bad reference.
        Err(err @ PlanError::PolicyNotFound(_)) => Err(AppError::not_found(err.to_string())),
        Err(err) => Err(err.into()),
    }
}
