use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use warden_infra::{ObjectStoreError, OrchestratorError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        OrchestratorError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        OrchestratorError::Validation(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        OrchestratorError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        OrchestratorError::ProvisionerUnavailable { .. } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "provisioner_unavailable",
            message,
        ),
        OrchestratorError::DeadlineExceeded(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "deadline_exceeded", message)
        }
        OrchestratorError::TerminationFailed { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "termination_failed", message)
        }
        OrchestratorError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
    }
}

pub fn object_error_to_response(err: ObjectStoreError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        ObjectStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        ObjectStoreError::Invalid(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        ObjectStoreError::Storage(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
