//! Defines the REST surface of the scheduler.
//!
//! ## Structure
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Plans**
//!   - `POST   /v1/plans`: create
//!   - `GET    /v1/plans`: list
//!   - `GET    /v1/plans/{id}`: fetch one
//!   - `PUT    /v1/plans/{id}`: partial update
//!   - `DELETE /v1/plans/{id}`: delete (idempotent)
//!   - `POST   /v1/plans/{id}/run`: start a job now
//!
//! - **Jobs**: `GET /v1/jobs[?planId=]`, `GET /v1/jobs/{id}`
//! - **Policies**: `POST/GET /v1/policies`, `GET /v1/policies/{id}`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        job_handlers::{get_job, list_jobs},
        plan_handlers::{create_plan, delete_plan, get_plan, list_plans, run_plan, update_plan},
        policy_handlers::{create_policy, get_policy, list_policies},
    },
    services::{metadata_store::MetadataStore, plan_service::PlanService},
};
use axum::{
    Router,
    routing::{get, post},
};
use std::{path::PathBuf, sync::Arc};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub plans: Arc<PlanService>,
    pub store: Arc<dyn MetadataStore>,
    pub storage_dir: PathBuf,
}

/// Build and return the router carrying `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/plans", post(create_plan).get(list_plans))
        .route(
            "/v1/plans/{id}",
            get(get_plan).put(update_plan).delete(delete_plan),
        )
        .route("/v1/plans/{id}/run", post(run_plan))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/policies", post(create_policy).get(list_policies))
        .route("/v1/policies/{id}", get(get_policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{dispatcher::Dispatcher, lock::LockOutcome},
        testkit::{FakeLock, MemoryStore, RecordingProducer, RecordingTriggers},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app_with(lock: Arc<FakeLock>, storage_dir: PathBuf) -> Router {
        let store = MemoryStore::new();
        let dispatcher = Dispatcher::new(RecordingProducer::new(), "migration");
        let plans = Arc::new(PlanService::new(
            store.clone(),
            lock,
            RecordingTriggers::new(),
            dispatcher,
        ));
        routes().with_state(AppState {
            plans,
            store,
            storage_dir,
        })
    }

    fn app() -> Router {
        app_with(FakeLock::new(), std::env::temp_dir())
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn plan_body(name: &str, dest_bucket: &str) -> Value {
        json!({
            "name": name,
            "sourceConn": {"storType": "internal", "bucketName": "bucketA"},
            "destConn": {"storType": "internal", "bucketName": dest_bucket},
        })
    }

    #[tokio::test]
    async fn probes_answer() {
        let app = app();
        assert_eq!(call(&app, Method::GET, "/healthz", None).await.0, StatusCode::OK);

        let dir = tempfile::TempDir::new().unwrap();
        let app = app_with(FakeLock::new(), dir.path().to_path_buf());
        let (status, body) = call(&app, Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["disk"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn plan_lifecycle_over_http() {
        let app = app();

        let (status, body) = call(&app, Method::POST, "/v1/plans", Some(plan_body("same", "bucketA"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], json!(400));

        let (status, plan) = call(&app, Method::POST, "/v1/plans", Some(plan_body("nightly", "bucketB"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = plan["id"].as_str().unwrap().to_string();

        let (status, updated) = call(
            &app,
            Method::PUT,
            &format!("/v1/plans/{id}"),
            Some(json!({"description": "every night"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["description"], json!("every night"));

        let (status, run) = call(&app, Method::POST, &format!("/v1/plans/{id}/run"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = run["jobId"].as_str().unwrap().to_string();

        let (status, job) = call(&app, Method::GET, &format!("/v1/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], json!("pending"));
        assert_eq!(job["sourceLocation"], json!("bucketA"));

        let (_, jobs) = call(&app, Method::GET, &format!("/v1/jobs?planId={id}"), None).await;
        assert_eq!(jobs.as_array().unwrap().len(), 1);

        for _ in 0..2 {
            let (status, _) = call(&app, Method::DELETE, &format!("/v1/plans/{id}"), None).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let (status, _) = call(&app, Method::GET, &format!("/v1/plans/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn busy_plan_is_a_conflict() {
        let app = app_with(FakeLock::scripted([LockOutcome::Busy]), std::env::temp_dir());
        let (_, plan) = call(&app, Method::POST, "/v1/plans", Some(plan_body("p", "bucketB"))).await;
        let id = plan["id"].as_str().unwrap();

        let (status, _) = call(&app, Method::POST, &format!("/v1/plans/{id}/run"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn policies_are_created_and_referenced() {
        let app = app();
        let (status, policy) = call(
            &app,
            Method::POST,
            "/v1/policies",
            Some(json!({"name": "hourly", "intervalSecs": 3600})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let policy_id = policy["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, Method::GET, &format!("/v1/policies/{policy_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/v1/policies/{}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut body = plan_body("scheduled", "bucketB");
        body["policyId"] = json!(uuid::Uuid::new_v4().to_string());
        let (status, _) = call(&app, Method::POST, "/v1/plans", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
