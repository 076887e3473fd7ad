pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::bridge::handlers as helper_handlers;
use crate::latex::handlers as document_handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Helper bridge
        .route(
            "/api/v1/helpers/:name",
            post(helper_handlers::handle_run_helper),
        )
        // LaTeX rendering
        .route(
            "/api/v1/documents/detect",
            post(document_handlers::handle_detect),
        )
        .route(
            "/api/v1/documents/compile",
            post(document_handlers::handle_compile),
        )
        .with_state(state)
}
