use axum::{
    routing::{get, post, put},
    Router,
};

pub mod events;
pub mod jobs;
pub mod objects;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/events", post(events::ingest_event))
        .route("/objects/*key", put(objects::put_object).get(objects::get_object))
        .route("/alerts", get(system::list_alerts))
}
