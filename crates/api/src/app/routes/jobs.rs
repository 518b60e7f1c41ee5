use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use warden_core::{JobId, JobState, LifecycleEvent};
use warden_infra::provisioning::ReclaimOutcome;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

const DEFAULT_LIST_LIMIT: usize = 50;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/reclaim", post(reclaim_job))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

/// Accept a job. Provisioning happens asynchronously, hence `202`.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let job = match services.orchestrator.register(body.into()).await {
        Ok(job) => job,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    services.request_provisioning(LifecycleEvent::provision_requested(job.id));

    (
        StatusCode::ACCEPTED,
        Json(dto::SubmitJobResponse {
            id: job.id,
            input_reference: job.input_reference,
            status: job.state,
        }),
    )
        .into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let state = match query.state.as_deref() {
        None => None,
        Some(s) => match s.parse::<JobState>() {
            Ok(state) => Some(state),
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_state", e.to_string());
            }
        },
    };

    match services
        .orchestrator
        .list(state, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
    {
        Ok(jobs) => {
            let items: Vec<dto::JobView> = jobs.into_iter().map(dto::JobView::from).collect();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.get_status(id).await {
        Ok(job) => (StatusCode::OK, Json(dto::JobView::from(job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Cancel a job; cancelling a finished job returns it unchanged.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::CancelJobRequest>>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let reason = body.and_then(|Json(b)| b.reason);

    match services.orchestrator.cancel(id, reason).await {
        Ok(job) => (StatusCode::OK, Json(dto::JobView::from(job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Operator retry of a stalled reclaim.
pub async fn reclaim_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.reclaim(id).await {
        Ok(ReclaimOutcome::Reclaimed(job) | ReclaimOutcome::AlreadyReclaimed(job)) => {
            (StatusCode::OK, Json(dto::JobView::from(job))).into_response()
        }
        Ok(ReclaimOutcome::InProgress(id)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": id, "status": "reclaim_in_progress" })),
        )
            .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
