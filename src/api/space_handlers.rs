use super::{AppError, AppState};
use axum::{Json, extract::State};
use vidforge_api::models::{CheckSpaceRequest, CheckSpaceResponse, DiskSpaceConfig, DiskUsage};

/// Pre-ingest admission check
pub async fn check_space(
    State(state): State<AppState>,
    Json(request): Json<CheckSpaceRequest>,
) -> Result<Json<CheckSpaceResponse>, AppError> {
    tracing::debug!(
        target: "api::space",
        original_size = request.original_file_size,
        "Admission check requested"
    );
    Ok(Json(state.budget.check_space(&request).await))
}

/// Read the quota configuration
pub async fn get_config(
    State(state): State<AppState>,
) -> Result<Json<DiskSpaceConfig>, AppError> {
    Ok(Json(state.budget.config().await))
}

/// Update the quota configuration
pub async fn set_config(
    State(state): State<AppState>,
    Json(config): Json<DiskSpaceConfig>,
) -> Result<Json<DiskSpaceConfig>, AppError> {
    if config.max_total_space_gb <= 0.0 {
        return Err(AppError::Validation(
            "maxTotalSpaceGB must be positive".to_string(),
        ));
    }
    if config.reserved_space_gb < 0.0 || config.reserved_space_gb >= config.max_total_space_gb {
        return Err(AppError::Validation(
            "reservedSpaceGB must be non-negative and below maxTotalSpaceGB".to_string(),
        ));
    }

    tracing::info!(
        target: "api::space",
        max_gb = config.max_total_space_gb,
        reserved_gb = config.reserved_space_gb,
        enabled = config.is_enabled,
        "Quota configuration update"
    );
    let applied = state.budget.set_config(config).await?;
    Ok(Json(applied))
}

/// Live usage snapshot
pub async fn usage(State(state): State<AppState>) -> Result<Json<DiskUsage>, AppError> {
    Ok(Json(state.budget.status().await))
}
