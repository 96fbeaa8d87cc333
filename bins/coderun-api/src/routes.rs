use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/spec", get(handlers::list_specs))
        .route("/api/v1/questions", get(handlers::list_questions))
        .route("/api/v1/questions/:id", get(handlers::get_question))
        .route("/api/v1/exec", post(handlers::submit))
        .route("/api/v1/submissions", get(handlers::list_submissions))
        .route("/api/v1/submissions/:id", get(handlers::get_submission))
}
