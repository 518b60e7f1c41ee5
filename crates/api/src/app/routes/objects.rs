use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use warden_infra::ObjectStore;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Upload a job input. The content type is mandatory.
pub async fn put_object(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let content_type = match headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(v) => v.to_string(),
        None => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "missing_content_type",
                "Content-Type header is required",
            );
        }
    };

    let size = body.len();
    match services.objects.put(&key, &content_type, body.to_vec()).await {
        Ok(reference) => (
            StatusCode::CREATED,
            Json(dto::StoredObjectResponse {
                key,
                content_type,
                size,
                reference,
            }),
        )
            .into_response(),
        Err(e) => errors::object_error_to_response(e),
    }
}

pub async fn get_object(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    match services.objects.get(&key).await {
        Ok(object) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, object.content_type)],
            object.bytes,
        )
            .into_response(),
        Err(e) => errors::object_error_to_response(e),
    }
}
