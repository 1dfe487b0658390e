use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the server for any failed request.
///
/// `error_type` is a stable machine-readable tag; `error` is the
/// human-readable message. Resource errors carry the space detail fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_space: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_space: Option<u64>,
}

/// Main error type for VidForge API operations
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request rejected by server-side validation (4xx, never retried)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with existing state (e.g. re-init with different parameters)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Server rejected the upload for lack of disk space
    #[error("Insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientDiskSpace { required: u64, available: u64 },

    /// File exceeds the per-file cap
    #[error("File too large: {0}")]
    FileTooLarge(String),

    /// Chunk checksum mismatch; the chunk should be re-sent
    #[error("Chunk {chunk_index} integrity check failed: {message}")]
    ChunkIntegrity { chunk_index: usize, message: String },

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Retry budget exhausted for a chunk
    #[error("Maximum retries ({max_retries}) exceeded for chunk {chunk_index}")]
    MaxRetriesExceeded {
        chunk_index: usize,
        max_retries: u32,
    },

    /// Server returned a failure status with a structured body
    #[error("Server error ({status}): {message}")]
    Server {
        status: u16,
        error_type: String,
        message: String,
    },

    /// HTTP transport error
    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Local file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Build an error from a failed HTTP response body
    pub fn from_error_body(status: u16, body: ErrorBody) -> Self {
        match body.error_type.as_str() {
            "Validation" => ApiError::Validation(body.error),
            "NotFound" => ApiError::NotFound(body.error),
            "Conflict" => ApiError::Conflict(body.error),
            "FileTooLarge" => ApiError::FileTooLarge(body.error),
            "InsufficientDiskSpace" => ApiError::InsufficientDiskSpace {
                required: body.required_space.unwrap_or_default(),
                available: body.available_space.unwrap_or_default(),
            },
            "ChunkIntegrity" => ApiError::ChunkIntegrity {
                chunk_index: 0,
                message: body.error,
            },
            "Timeout" => ApiError::Timeout,
            _ => ApiError::Server {
                status,
                error_type: body.error_type,
                message: body.error,
            },
        }
    }

    /// Stable machine-readable tag for this error
    pub fn error_type(&self) -> &str {
        match self {
            ApiError::Validation(_) => "Validation",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::InsufficientDiskSpace { .. } => "InsufficientDiskSpace",
            ApiError::FileTooLarge(_) => "FileTooLarge",
            ApiError::ChunkIntegrity { .. } => "ChunkIntegrity",
            ApiError::Timeout => "Timeout",
            ApiError::Cancelled => "Cancelled",
            ApiError::MaxRetriesExceeded { .. } => "MaxRetriesExceeded",
            ApiError::Server { .. } => "ChunkedUploadError",
            ApiError::RequestError(_) => "NetworkError",
            ApiError::JsonError(_) => "NetworkError",
            ApiError::InvalidUrl(_) => "Validation",
            ApiError::Io(_) => "IoError",
            ApiError::Other(_) => "Unknown",
        }
    }

    /// Check whether the client may retry the failed operation.
    ///
    /// Transient transport failures, timeouts, 408/429/5xx responses and
    /// chunk integrity mismatches are retryable; validation, resource and
    /// fatal errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Timeout => true,
            ApiError::ChunkIntegrity { .. } => true,
            ApiError::RequestError(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            ApiError::Server { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Check if this error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_5xx_is_retryable() {
        let err = ApiError::Server {
            status: 503,
            error_type: "ChunkedUploadError".to_string(),
            message: "unavailable".to_string(),
        };
        assert!(err.is_retryable());

        let err = ApiError::Server {
            status: 400,
            error_type: "Validation".to_string(),
            message: "bad".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn integrity_is_retryable_but_validation_is_not() {
        assert!(
            ApiError::ChunkIntegrity {
                chunk_index: 3,
                message: "md5 mismatch".to_string()
            }
            .is_retryable()
        );
        assert!(!ApiError::Validation("zero-byte file".to_string()).is_retryable());
    }

    #[test]
    fn error_body_round_trips_space_detail() {
        let body = ErrorBody {
            error: "not enough space".to_string(),
            error_type: "InsufficientDiskSpace".to_string(),
            required_space: Some(20 << 30),
            available_space: Some(5 << 30),
        };
        match ApiError::from_error_body(413, body) {
            ApiError::InsufficientDiskSpace {
                required,
                available,
            } => {
                assert_eq!(required, 20 << 30);
                assert_eq!(available, 5 << 30);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
