use crate::error::{ApiError, ApiResult, ErrorBody};
use crate::models::{
    CheckSpaceRequest, CheckSpaceResponse, ChunkUploadResponse, CleanupResult,
    CompleteUploadResponse, DiskSpaceConfig, DiskUsage, InitUploadRequest, InitUploadResponse,
    SimpleResponse, TaskListPage, TaskSnapshot, UploadStatusResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client as HttpClient, Response, StatusCode, multipart};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const API_PREFIX: &str = "/api";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the VidForge server (e.g., "http://localhost:3000")
    pub base_url: String,
    /// Timeout for plain JSON requests in seconds
    pub timeout_seconds: u64,
    /// Timeout for a single chunk upload request in seconds
    pub chunk_timeout_seconds: u64,
}

impl ClientConfig {
    /// Create a new configuration with the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_seconds: 60,
            chunk_timeout_seconds: 300,
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set the per-chunk upload timeout
    pub fn with_chunk_timeout(mut self, timeout_seconds: u64) -> Self {
        self.chunk_timeout_seconds = timeout_seconds;
        self
    }
}

/// Main VidForge API client
pub struct Client {
    config: ClientConfig,
    http_client: HttpClient,
}

impl Client {
    /// Create a new API client
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        let http_client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Build the full URL for an API endpoint
    fn build_url(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.config.base_url.trim_end_matches('/'),
            API_PREFIX,
            path
        )
    }

    /// Decode a response: JSON body on success, structured error otherwise
    async fn handle_response<R>(response: Response) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(ApiError::Timeout);
        }

        let body: ErrorBody = response.json().await.unwrap_or_else(|_| ErrorBody {
            error: format!("HTTP {}", status),
            error_type: "ChunkedUploadError".to_string(),
            required_space: None,
            available_space: None,
        });

        Err(ApiError::from_error_body(status.as_u16(), body))
    }

    async fn get_json<R>(&self, path: &str) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let response = self
            .http_client
            .get(self.build_url(path))
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn post_json<T, R>(&self, path: &str, body: &T) -> ApiResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http_client
            .post(self.build_url(path))
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Liveness probe
    pub async fn health(&self) -> ApiResult<()> {
        let response = self
            .http_client
            .get(self.build_url("/health"))
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ApiError::Server {
                status: response.status().as_u16(),
                error_type: "Unhealthy".to_string(),
                message: "health check failed".to_string(),
            })
        }
    }

    /// Open (or idempotently re-open) a chunked upload session
    pub async fn init_chunked_upload(
        &self,
        request: &InitUploadRequest,
    ) -> ApiResult<InitUploadResponse> {
        self.post_json("/upload/chunked/init", request).await
    }

    /// Send a single chunk as a multipart form
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        total_chunks: usize,
        chunk_md5: &str,
        chunk: Bytes,
    ) -> ApiResult<ChunkUploadResponse> {
        let part = multipart::Part::stream(reqwest::Body::from(chunk))
            .file_name(format!("chunk_{chunk_index:06}"))
            .mime_str("application/octet-stream")?;

        let form = multipart::Form::new()
            .text("uploadId", upload_id.to_string())
            .text("chunkIndex", chunk_index.to_string())
            .text("totalChunks", total_chunks.to_string())
            .text("chunkMd5", chunk_md5.to_string())
            .part("chunk", part);

        let response = self
            .http_client
            .post(self.build_url("/upload/chunked/chunk"))
            .timeout(Duration::from_secs(self.config.chunk_timeout_seconds))
            .multipart(form)
            .send()
            .await?;

        // Attach the chunk index to integrity failures so the caller can
        // retry the exact chunk
        match Self::handle_response(response).await {
            Err(ApiError::ChunkIntegrity { message, .. }) => Err(ApiError::ChunkIntegrity {
                chunk_index,
                message,
            }),
            other => other,
        }
    }

    /// Fetch the received-chunk set for resume
    pub async fn upload_status(&self, upload_id: &str) -> ApiResult<UploadStatusResponse> {
        self.get_json(&format!("/upload/chunked/status/{upload_id}"))
            .await
    }

    /// Finalize the session: merge, validate and hand off to conversion
    pub async fn complete_upload(&self, upload_id: &str) -> ApiResult<CompleteUploadResponse> {
        self.post_json(&format!("/upload/chunked/complete/{upload_id}"), &())
            .await
    }

    /// Poll a task snapshot
    pub async fn task_status(&self, task_id: &str) -> ApiResult<TaskSnapshot> {
        self.get_json(&format!("/conversion/status/{task_id}")).await
    }

    /// Request cancellation of a pending or converting task
    pub async fn cancel_task(&self, task_id: &str) -> ApiResult<SimpleResponse> {
        self.post_json(&format!("/conversion/cancel/{task_id}"), &())
            .await
    }

    /// Download the converted output to a local file, returning bytes written
    pub async fn download_output(&self, task_id: &str, dest: &Path) -> ApiResult<u64> {
        let response = self
            .http_client
            .get(self.build_url(&format!("/conversion/download/{task_id}")))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body: ErrorBody = response.json().await.unwrap_or_default();
            return Err(ApiError::from_error_body(status.as_u16(), body));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// List tasks, paged, with optional status and name filters
    pub async fn list_tasks(
        &self,
        page: i64,
        page_size: i64,
        status: Option<&str>,
        search: Option<&str>,
    ) -> ApiResult<TaskListPage> {
        let mut path = format!("/task/list?page={page}&pageSize={page_size}");
        if let Some(status) = status {
            path.push_str(&format!("&status={status}"));
        }
        if let Some(search) = search {
            path.push_str(&format!(
                "&search={}",
                url::form_urlencoded::byte_serialize(search.as_bytes()).collect::<String>()
            ));
        }
        self.get_json(&path).await
    }

    /// Delete a task and its files (rejected while converting)
    pub async fn delete_task(&self, task_id: &str) -> ApiResult<SimpleResponse> {
        let response = self
            .http_client
            .delete(self.build_url(&format!("/task/{task_id}")))
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Pre-ingest admission check
    pub async fn check_space(&self, request: &CheckSpaceRequest) -> ApiResult<CheckSpaceResponse> {
        self.post_json("/diskspace/check-space", request).await
    }

    /// Live disk usage snapshot
    pub async fn disk_usage(&self) -> ApiResult<DiskUsage> {
        self.get_json("/diskspace/usage").await
    }

    /// Read the quota configuration
    pub async fn disk_config(&self) -> ApiResult<DiskSpaceConfig> {
        self.get_json("/diskspace/config").await
    }

    /// Update the quota configuration
    pub async fn set_disk_config(&self, config: &DiskSpaceConfig) -> ApiResult<DiskSpaceConfig> {
        self.post_json("/diskspace/config", config).await
    }

    /// Run a targeted cleanup sweep
    pub async fn run_cleanup(
        &self,
        cleanup_type: &str,
        ignore_retention: bool,
    ) -> ApiResult<CleanupResult> {
        self.post_json(
            &format!("/cleanup/cleanup/{cleanup_type}?ignoreRetention={ignore_retention}"),
            &(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_joins_base_and_prefix() {
        let client = Client::new(ClientConfig::new("http://localhost:3000/")).unwrap();
        assert_eq!(
            client.build_url("/upload/chunked/init"),
            "http://localhost:3000/api/upload/chunked/init"
        );
    }
}
