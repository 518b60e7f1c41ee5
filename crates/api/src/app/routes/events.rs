use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use warden_core::LifecycleEvent;

use crate::app::errors;
use crate::app::services::AppServices;

/// Webhook for lifecycle signals (e.g. a compute unit reporting completion).
///
/// Redelivering the same signal is safe: the response says whether it was
/// applied, a duplicate, or stale.
pub async fn ingest_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<LifecycleEvent>,
) -> axum::response::Response {
    match services.orchestrator.ingest(event).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
