use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/validate", post(handlers::validate))
        .route("/execute", post(handlers::execute))
        .route("/test", post(handlers::run_test))
        .route("/suite", post(handlers::run_suite))
        .route("/suite/stream", post(handlers::stream_suite))
        .route("/classify", post(handlers::classify))
        .route("/progress/:user_id", get(handlers::get_progress))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}
