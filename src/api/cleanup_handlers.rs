use super::{AppError, AppState};
use crate::cleanup::CleanupScope;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use vidforge_api::models::CleanupResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    #[serde(default)]
    pub ignore_retention: bool,
}

/// Run a targeted sweep: `downloads | temp | orphans | logs | all`
pub async fn run_cleanup(
    State(state): State<AppState>,
    Path(cleanup_type): Path<String>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<CleanupResult>, AppError> {
    let scope = CleanupScope::from_str(&cleanup_type)
        .ok_or_else(|| AppError::Validation(format!("Unknown cleanup type: {cleanup_type}")))?;

    tracing::info!(
        target: "api::cleanup",
        scope = ?scope,
        ignore_retention = query.ignore_retention,
        "Cleanup sweep requested"
    );

    let result = state
        .cleanup
        .perform_cleanup(scope, query.ignore_retention)
        .await?;
    Ok(Json(result))
}
