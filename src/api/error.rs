use crate::ingest::IngestError;
use crate::store::StoreError;
use crate::tasks::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use vidforge_api::error::ErrorBody;

/// Error type for API handlers.
///
/// Every failure is serialized as `{error, errorType, ...detail}` with a
/// stable machine-readable tag so clients can classify without parsing
/// messages.
#[derive(Debug)]
pub enum AppError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    InsufficientSpace {
        required: u64,
        available: u64,
        message: String,
    },
    FileTooLarge(String),
    ChunkIntegrity {
        chunk_index: usize,
        message: String,
    },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(msg) => AppError::Validation(msg),
            IngestError::FileTooLarge { size, max } => AppError::FileTooLarge(format!(
                "File size {size} exceeds the per-file cap of {max} bytes"
            )),
            IngestError::InsufficientSpace {
                required,
                available,
                details,
            } => AppError::InsufficientSpace {
                required,
                available,
                message: details,
            },
            IngestError::SessionNotFound(id) => {
                AppError::NotFound(format!("Unknown upload session: {id}"))
            }
            IngestError::ParamsMismatch(id) => AppError::Conflict(format!(
                "Session {id} already exists with different parameters"
            )),
            err @ IngestError::ChunkOutOfRange { .. } => AppError::Validation(err.to_string()),
            err @ IngestError::ChunkSizeMismatch { .. } => AppError::Validation(err.to_string()),
            err @ IngestError::CompletionInProgress(_) => AppError::Conflict(err.to_string()),
            IngestError::Incomplete { missing } => AppError::Conflict(format!(
                "Upload incomplete; missing chunk indices: {missing:?}"
            )),
            IngestError::Store(StoreError::IntegrityMismatch {
                chunk_index,
                expected,
                actual,
            }) => AppError::ChunkIntegrity {
                chunk_index,
                message: format!("expected {expected}, got {actual}"),
            },
            IngestError::Store(err) => AppError::Internal(err.into()),
            IngestError::Other(err) => AppError::Internal(err),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => AppError::NotFound(msg),
            EngineError::IllegalState(msg) => AppError::Conflict(msg),
            EngineError::Other(err) => AppError::Internal(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Validation(msg) => {
                tracing::warn!(target: "api::error", status = 400, error = %msg, "Validation error");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorBody {
                        error: msg,
                        error_type: "Validation".to_string(),
                        ..Default::default()
                    },
                )
            }
            AppError::NotFound(msg) => {
                tracing::warn!(target: "api::error", status = 404, error = %msg, "Not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorBody {
                        error: msg,
                        error_type: "NotFound".to_string(),
                        ..Default::default()
                    },
                )
            }
            AppError::Conflict(msg) => {
                tracing::warn!(target: "api::error", status = 409, error = %msg, "Conflict");
                (
                    StatusCode::CONFLICT,
                    ErrorBody {
                        error: msg,
                        error_type: "Conflict".to_string(),
                        ..Default::default()
                    },
                )
            }
            AppError::InsufficientSpace {
                required,
                available,
                message,
            } => {
                tracing::warn!(
                    target: "api::error",
                    status = 413,
                    required,
                    available,
                    "Insufficient disk space"
                );
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    ErrorBody {
                        error: message,
                        error_type: "InsufficientDiskSpace".to_string(),
                        required_space: Some(required),
                        available_space: Some(available),
                    },
                )
            }
            AppError::FileTooLarge(msg) => {
                tracing::warn!(target: "api::error", status = 413, error = %msg, "File too large");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    ErrorBody {
                        error: msg,
                        error_type: "FileTooLarge".to_string(),
                        ..Default::default()
                    },
                )
            }
            AppError::ChunkIntegrity {
                chunk_index,
                message,
            } => {
                tracing::warn!(
                    target: "api::error",
                    status = 422,
                    chunk = chunk_index,
                    "Chunk integrity failure"
                );
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorBody {
                        error: format!("Chunk {chunk_index} integrity check failed: {message}"),
                        error_type: "ChunkIntegrity".to_string(),
                        ..Default::default()
                    },
                )
            }
            AppError::Internal(err) => {
                tracing::error!(target: "api::error", status = 500, error = ?err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Internal server error".to_string(),
                        error_type: "Internal".to_string(),
                        ..Default::default()
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
