mod cleanup_handlers;
mod error;
mod hub;
mod space_handlers;
mod task_handlers;
mod upload_handlers;

pub use error::AppError;

use crate::cleanup::RetentionEngine;
use crate::ingest::SessionManager;
use crate::push::PushBus;
use crate::space::DiskBudget;
use crate::tasks::ConversionEngine;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<ConversionEngine>,
    pub budget: Arc<DiskBudget>,
    pub cleanup: Arc<RetentionEngine>,
    pub push: PushBus,
}

/// Create the API router
pub fn create_router(state: AppState, max_chunk_body: usize) -> Router {
    tracing::debug!(target: "api", "Creating API router");

    Router::new()
        // Health check
        .route("/api/health", get(health_check))
        // Chunked upload protocol
        .route("/api/upload/chunked/init", post(upload_handlers::init))
        .route(
            "/api/upload/chunked/chunk",
            post(upload_handlers::chunk).layer(DefaultBodyLimit::max(max_chunk_body)),
        )
        .route(
            "/api/upload/chunked/status/:upload_id",
            get(upload_handlers::status),
        )
        .route(
            "/api/upload/chunked/complete/:upload_id",
            post(upload_handlers::complete),
        )
        // Conversion tasks
        .route(
            "/api/conversion/status/:task_id",
            get(task_handlers::status),
        )
        .route(
            "/api/conversion/cancel/:task_id",
            post(task_handlers::cancel),
        )
        .route(
            "/api/conversion/download/:task_id",
            get(task_handlers::download),
        )
        .route(
            "/api/conversion/tasks/active",
            get(task_handlers::active_tasks),
        )
        .route("/api/task/list", get(task_handlers::list))
        .route("/api/task/:task_id", delete(task_handlers::remove))
        // Disk budget
        .route(
            "/api/diskspace/check-space",
            post(space_handlers::check_space),
        )
        .route(
            "/api/diskspace/config",
            get(space_handlers::get_config).post(space_handlers::set_config),
        )
        .route("/api/diskspace/usage", get(space_handlers::usage))
        // Cleanup
        .route(
            "/api/cleanup/cleanup/:cleanup_type",
            post(cleanup_handlers::run_cleanup),
        )
        // Realtime hub
        .route("/conversionHub", get(hub::hub_handler))
        .with_state(state)
}

/// Liveness probe
async fn health_check() -> axum::http::StatusCode {
    tracing::debug!(target: "api", "Health check requested");
    axum::http::StatusCode::OK
}
