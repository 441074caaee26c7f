//! Route definitions for the HTTP server.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::{handlers, state::AppState, ws};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates the router with every API endpoint configured.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/tasks", post(handlers::create_task))
        .route("/api/v1/tasks", get(handlers::list_tasks))
        .route("/api/v1/tasks/{id}", get(handlers::get_task))
        .route("/api/v1/tasks/{id}", delete(handlers::delete_task))
        .route("/api/v1/tasks/{id}/resume", post(handlers::resume_task))
        .route("/api/v1/tasks/{id}/output", get(handlers::get_task_output))
        .route("/api/v1/tasks/{id}/logs", get(handlers::get_vm_logs))
        .route(
            "/api/v1/tasks/{id}/logs/stream",
            get(handlers::stream_vm_logs),
        )
        .route("/api/v1/tasks/{id}/stream", get(ws::ws_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
