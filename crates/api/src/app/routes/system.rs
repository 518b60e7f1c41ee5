use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use warden_infra::OperatorAlert;

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Compute units that could not be reclaimed and need an operator.
pub async fn list_alerts(Extension(services): Extension<Arc<AppServices>>) -> Json<Vec<OperatorAlert>> {
    Json(services.alerts.all())
}
