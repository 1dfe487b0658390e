use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Conversion parameters attached to an upload, passed through to the encoder.
///
/// The well-known fields drive output naming and size estimation; everything
/// else rides along in `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversionParams {
    pub output_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ConversionParams {
    pub fn new(output_format: impl Into<String>) -> Self {
        Self {
            output_format: output_format.into(),
            ..Default::default()
        }
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = Some(codec.into());
        self
    }

    pub fn with_audio_codec(mut self, codec: impl Into<String>) -> Self {
        self.audio_codec = Some(codec.into());
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }
}

/// Request body for `POST /api/upload/chunked/init`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    /// Client-chosen session ID, unique across the client's active sessions
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Content fingerprint (full MD5 below the quick-fingerprint threshold)
    pub file_md5: String,
    pub conversion_request: ConversionParams,
}

/// Response body for `POST /api/upload/chunked/init`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub chunk_size: u64,
    pub total_chunks: usize,
    /// True when the fingerprint matched an existing artifact and no chunk
    /// transfer is needed
    pub file_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

/// Response body for `POST /api/upload/chunked/chunk`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub chunk_index: usize,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
    /// Fraction of chunks received (0.0 - 1.0)
    pub progress: f64,
}

/// Response body for `GET /api/upload/chunked/status/{uploadId}`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    /// Indices of chunks the server has already persisted
    pub uploaded_chunks: Vec<usize>,
    pub total_chunks: usize,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub progress: f64,
}

/// Response body for `POST /api/upload/chunked/complete/{uploadId}`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub task_id: String,
    pub task_name: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_params_flatten_extra_fields() {
        let json = r#"{
            "outputFormat": "mp4",
            "videoCodec": "h264",
            "crf": 23,
            "preset": "fast"
        }"#;
        let params: ConversionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.output_format, "mp4");
        assert_eq!(params.video_codec.as_deref(), Some("h264"));
        assert_eq!(params.extra.get("crf"), Some(&serde_json::json!(23)));
        assert_eq!(params.extra.get("preset"), Some(&serde_json::json!("fast")));
    }

    #[test]
    fn init_request_uses_camel_case_wire_names() {
        let request = InitUploadRequest {
            upload_id: "u-1".to_string(),
            file_name: "movie.mkv".to_string(),
            file_size: 1024,
            file_md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            conversion_request: ConversionParams::new("mp4"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("uploadId").is_some());
        assert!(value.get("fileMd5").is_some());
        assert!(value.get("conversionRequest").is_some());
    }
}
