use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health::health_handler))
        .route("/livez", get(handlers::health::liveness_handler))
        .route(
            "/api/buildjobs",
            post(handlers::build_jobs::create_build_job_handler),
        )
        .route(
            "/api/buildjobs/{name}",
            get(handlers::build_jobs::get_build_job_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
