use super::{AppError, AppState};
use axum::{
    Json,
    extract::{Multipart, Path, State},
};
use axum_macros::debug_handler;
use vidforge_api::models::{
    ChunkUploadResponse, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    UploadStatusResponse,
};

/// Open (or idempotently re-open) a chunked upload session
pub async fn init(
    State(state): State<AppState>,
    Json(request): Json<InitUploadRequest>,
) -> Result<Json<InitUploadResponse>, AppError> {
    tracing::info!(
        target: "api::upload",
        upload_id = %request.upload_id,
        file = %request.file_name,
        size = request.file_size,
        "Chunked upload init"
    );
    let response = state.sessions.init(request).await?;
    Ok(Json(response))
}

/// Receive one chunk as a multipart form:
/// `uploadId, chunkIndex, totalChunks, chunkMd5, chunk`
#[debug_handler]
pub async fn chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<usize> = None;
    let mut chunk_md5: Option<String> = None;
    let mut payload: Option<axum::body::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(format!("Malformed multipart body: {err}")))?
    {
        let name = field.name().map(|name| name.to_string());
        match name.as_deref() {
            Some("uploadId") => {
                upload_id = Some(read_text(field).await?);
            }
            Some("chunkIndex") => {
                let raw = read_text(field).await?;
                chunk_index = Some(raw.parse().map_err(|_| {
                    AppError::Validation(format!("chunkIndex is not a number: {raw}"))
                })?);
            }
            Some("chunkMd5") => {
                let tag = read_text(field).await?;
                if !tag.is_empty() {
                    chunk_md5 = Some(tag);
                }
            }
            Some("chunk") => {
                payload = Some(field.bytes().await.map_err(|err| {
                    AppError::Validation(format!("Failed to read chunk payload: {err}"))
                })?);
            }
            // totalChunks is advisory; the session is authoritative
            _ => {}
        }
    }

    let upload_id =
        upload_id.ok_or_else(|| AppError::Validation("Missing field: uploadId".to_string()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| AppError::Validation("Missing field: chunkIndex".to_string()))?;
    let payload =
        payload.ok_or_else(|| AppError::Validation("Missing field: chunk".to_string()))?;

    tracing::debug!(
        target: "api::upload",
        upload_id = %upload_id,
        chunk = chunk_index,
        bytes = payload.len(),
        "Chunk received"
    );

    let response = state
        .sessions
        .accept_chunk(&upload_id, chunk_index, &payload, chunk_md5.as_deref())
        .await?;
    Ok(Json(response))
}

/// Received-set snapshot for resume
pub async fn status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    tracing::debug!(target: "api::upload", upload_id = %upload_id, "Upload status requested");
    let response = state.sessions.status(&upload_id)?;
    Ok(Json(response))
}

/// Finalize the session
pub async fn complete(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    tracing::info!(target: "api::upload", upload_id = %upload_id, "Upload completion requested");
    let response = state.sessions.complete(&upload_id).await?;
    Ok(Json(response))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|err| AppError::Validation(format!("Failed to read multipart field: {err}")))
}
