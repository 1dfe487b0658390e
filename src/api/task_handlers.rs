use super::{AppError, AppState};
use crate::db::TaskListFilter;
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use vidforge_api::models::{SimpleResponse, TaskListPage, TaskSnapshot, TaskStatus};

/// Query parameters for the paged task listing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    pub status: Option<String>,
    pub search: Option<String>,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

/// Task snapshot poll
pub async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>, AppError> {
    tracing::debug!(target: "api::tasks", task_id = %task_id, "Task status requested");
    let snapshot = state
        .engine
        .get_status(&task_id)?
        .ok_or_else(|| AppError::NotFound(format!("Task not found: {task_id}")))?;
    Ok(Json(snapshot))
}

/// Cancel a pending or converting task
pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    tracing::info!(target: "api::tasks", task_id = %task_id, "Cancellation requested");
    state.engine.cancel(&task_id).await?;
    Ok(Json(SimpleResponse::ok()))
}

/// Stream the converted output and schedule its retention cleanup
pub async fn download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, AppError> {
    let task = state
        .engine
        .get_task(&task_id)?
        .ok_or_else(|| AppError::NotFound(format!("Task not found: {task_id}")))?;

    if task.status != TaskStatus::Completed {
        return Err(AppError::Conflict(format!(
            "Task {task_id} is {} and has no downloadable output",
            task.status.as_str()
        )));
    }

    let output_path = task
        .output_path
        .clone()
        .ok_or_else(|| AppError::NotFound(format!("Task {task_id} has no output file")))?;

    let file = tokio::fs::File::open(&output_path)
        .await
        .map_err(|err| AppError::NotFound(format!("Output file unavailable: {err}")))?;
    let length = file
        .metadata()
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0);

    // The download event starts the retention clock
    if let Err(err) = state.cleanup.record_download(&task, None) {
        tracing::warn!(
            target: "api::tasks",
            task_id = %task_id,
            error = %err,
            "Failed to record download for retention"
        );
    }

    tracing::info!(
        target: "api::tasks",
        task_id = %task_id,
        bytes = length,
        "Streaming output download"
    );

    let file_name = task
        .output_file_name
        .unwrap_or_else(|| format!("{task_id}.{}", task.output_format));
    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&task.output_format))
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(body)
        .map_err(|err| AppError::Internal(err.into()))
}

/// Paged task listing
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<TaskListPage>, AppError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            TaskStatus::from_str(raw)
                .ok_or_else(|| AppError::Validation(format!("Invalid status: {raw}")))?,
        ),
        None => None,
    };

    let page = state.engine.list(&TaskListFilter {
        status,
        search: query.search,
        page: query.page,
        page_size: query.page_size,
    })?;

    tracing::debug!(
        target: "api::tasks",
        total = page.total_items,
        page = page.page,
        "Task listing served"
    );
    Ok(Json(page))
}

/// Snapshot of every converting task
pub async fn active_tasks(
    State(state): State<AppState>,
) -> Result<Json<Vec<TaskSnapshot>>, AppError> {
    Ok(Json(state.engine.active_tasks()?))
}

/// Delete a task and its files
pub async fn remove(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    tracing::info!(target: "api::tasks", task_id = %task_id, "Task deletion requested");
    state.engine.delete(&task_id).await?;
    Ok(Json(SimpleResponse::ok()))
}

/// Content type for an output container extension
fn content_type_for(format: &str) -> &'static str {
    match format.to_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "ts" => "video/mp2t",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_cover_common_containers() {
        assert_eq!(content_type_for("mp4"), "video/mp4");
        assert_eq!(content_type_for("MKV"), "video/x-matroska");
        assert_eq!(content_type_for("weird"), "application/octet-stream");
    }
}
