//! Sender-side chunked upload driver.
//!
//! Drives the protocol end to end: fingerprint, init (with instant-upload
//! short-circuit), resume from the server's received set, bounded concurrent
//! chunk dispatch with a first-pass failure budget, a sequential
//! backoff-retry second pass for retryable failures, and completion.
//! Cancellation aborts in-flight dispatch and leaves the server session
//! resumable.

mod progress;

pub use progress::{
    FnProgress, NoOpProgress, ProgressCallback, ProgressTracker, ProgressUpdate, UploadPhase,
    format_bytes, format_eta, format_speed,
};

use crate::fingerprint;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vidforge_api::Client;
use vidforge_api::error::ApiError;
use vidforge_api::models::{ChunkUploadResponse, ConversionParams, InitUploadRequest};

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Upload error types
#[derive(Debug, Error)]
pub enum UploadError {
    /// Upload was cancelled; the server session stays resumable
    #[error("Upload cancelled")]
    Cancelled,

    #[error("{0}")]
    Validation(String),

    /// First-pass failure budget exceeded
    #[error("Too many chunk failures: {failed} failed, tolerance {tolerance}")]
    TooManyFailures { failed: usize, tolerance: usize },

    /// Second-pass retries exhausted for a chunk
    #[error("Maximum retries exceeded for chunk {chunk_index}")]
    MaxRetriesExceeded { chunk_index: usize },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration for the uploader
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Maximum chunks in flight concurrently
    pub max_in_flight: usize,
    /// Fraction of the work list allowed to fail in the first pass
    pub failure_tolerance: f64,
    /// How many of the backoff delays are used per chunk in the second pass
    pub retry_rounds: usize,
    /// Backoff delays between second-pass attempts, in seconds
    pub retry_delays: [u64; 5],
    /// Minimum interval between sampled progress reports
    pub progress_interval: Duration,
    /// Files at or above this size use the quick fingerprint
    pub quick_fingerprint_threshold: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            failure_tolerance: 0.05,
            retry_rounds: 3,
            retry_delays: [1, 2, 4, 8, 16],
            progress_interval: Duration::from_millis(500),
            quick_fingerprint_threshold: 500 * 1024 * 1024,
        }
    }
}

/// Parameters for one upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    /// Client-chosen session id; doubles as the client token for progress
    /// identifier reconciliation
    pub upload_id: String,
    pub params: ConversionParams,
}

impl UploadRequest {
    pub fn new(local_path: impl Into<PathBuf>, params: ConversionParams) -> Self {
        Self {
            local_path: local_path.into(),
            upload_id: Uuid::new_v4().to_string(),
            params,
        }
    }

    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = upload_id.into();
        self
    }
}

/// Result of a finished upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub task_id: String,
    pub task_name: String,
    /// True when the server already had the content and no chunks moved
    pub instant: bool,
    pub uploaded_bytes: u64,
}

/// First-pass failure budget: `max(1, ceil(tolerance * work_len))`
fn failure_budget(work_len: usize, tolerance: f64) -> usize {
    ((work_len as f64 * tolerance).ceil() as usize).max(1)
}

/// Confirmed indices shared between the dispatch passes and the tracker
struct ConfirmedSet {
    indices: std::sync::Mutex<BTreeSet<usize>>,
    chunk_size: u64,
    total_size: u64,
}

impl ConfirmedSet {
    fn new(resumed: BTreeSet<usize>, chunk_size: u64, total_size: u64) -> Self {
        Self {
            indices: std::sync::Mutex::new(resumed),
            chunk_size,
            total_size,
        }
    }

    /// Record an acknowledged index and return the exact byte/chunk totals.
    /// The short last chunk contributes its actual size, so the reported
    /// bytes are accurate whatever order chunks land in.
    fn confirm(&self, index: usize) -> (u64, usize) {
        let mut indices = self.indices.lock().expect("confirmed set poisoned");
        indices.insert(index);
        let bytes = indices
            .iter()
            .map(|&i| {
                let offset = i as u64 * self.chunk_size;
                self.total_size.saturating_sub(offset).min(self.chunk_size)
            })
            .sum();
        (bytes, indices.len())
    }
}

/// Chunked upload protocol driver
pub struct ChunkedUploader {
    api: Arc<Client>,
    config: UploaderConfig,
    cancel: CancellationToken,
}

impl ChunkedUploader {
    pub fn new(api: Arc<Client>, config: UploaderConfig) -> Self {
        Self {
            api,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an external cancellation token
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Request cancellation of the running upload
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drive one file to completion
    pub async fn upload<P: ProgressCallback + 'static>(
        &self,
        request: UploadRequest,
        progress: P,
    ) -> UploadResult<UploadOutcome> {
        let progress: Arc<P> = Arc::new(progress);

        let metadata = tokio::fs::metadata(&request.local_path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Validation(format!(
                "{} is not a regular file",
                request.local_path.display()
            )));
        }
        let total_size = metadata.len();
        if total_size == 0 {
            return Err(UploadError::Validation(
                "Zero-byte files cannot be uploaded".to_string(),
            ));
        }
        let file_name = request
            .local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::Validation("Path has no file name".to_string()))?;

        info!(
            target: "uploader",
            upload_id = %request.upload_id,
            path = %request.local_path.display(),
            size = total_size,
            "Starting upload"
        );

        // Fingerprint per the threshold rule
        progress.on_progress(boundary_update(UploadPhase::Fingerprinting, total_size));
        let fingerprint = fingerprint::compute_file(
            &request.local_path,
            total_size,
            self.config.quick_fingerprint_threshold,
        )
        .await?;
        self.check_cancelled()?;

        progress.on_progress(boundary_update(UploadPhase::Initializing, total_size));
        let init = self
            .api
            .init_chunked_upload(&InitUploadRequest {
                upload_id: request.upload_id.clone(),
                file_name: file_name.clone(),
                file_size: total_size,
                file_md5: fingerprint.value.clone(),
                conversion_request: request.params.clone(),
            })
            .await?;

        if init.file_exists {
            info!(
                target: "uploader",
                upload_id = %request.upload_id,
                task_id = ?init.task_id,
                "Instant upload: server already has this content"
            );
            let mut update = boundary_update(UploadPhase::Done, total_size);
            update.uploaded = total_size;
            update.progress = 1.0;
            progress.on_progress(update);
            return Ok(UploadOutcome {
                task_id: init.task_id.unwrap_or_default(),
                task_name: init.task_name.unwrap_or_default(),
                instant: true,
                uploaded_bytes: 0,
            });
        }

        let chunk_size = init.chunk_size;
        let total_chunks = init.total_chunks;
        let tracker = Arc::new(ProgressTracker::new(
            total_size,
            total_chunks,
            self.config.progress_interval,
        ));

        // Resume: pre-populate the received set from the server
        let status = self.api.upload_status(&request.upload_id).await?;
        let received: BTreeSet<usize> = status.uploaded_chunks.iter().copied().collect();
        tracker.set_confirmed(status.uploaded_bytes, received.len());
        tracker.emit(&*progress, UploadPhase::Transferring, true);

        if !received.is_empty() {
            info!(
                target: "uploader",
                upload_id = %request.upload_id,
                resumed_chunks = received.len(),
                "Resuming upload from server state"
            );
        }

        let work: Vec<usize> = (0..total_chunks)
            .filter(|index| !received.contains(index))
            .collect();
        let confirmed = Arc::new(ConfirmedSet::new(received, chunk_size, total_size));

        let failed = self
            .first_pass(
                &request,
                &work,
                chunk_size,
                total_size,
                total_chunks,
                &confirmed,
                &tracker,
                &progress,
            )
            .await?;

        if !failed.is_empty() {
            self.second_pass(
                &request,
                failed,
                chunk_size,
                total_size,
                total_chunks,
                &confirmed,
                &tracker,
                &progress,
            )
            .await?;
        }

        tracker.emit(&*progress, UploadPhase::Completing, true);
        let complete = tokio::select! {
            response = self.api.complete_upload(&request.upload_id) => response?,
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
        };

        tracker.set_confirmed(total_size, total_chunks);
        tracker.emit(&*progress, UploadPhase::Done, true);

        info!(
            target: "uploader",
            upload_id = %request.upload_id,
            task_id = %complete.task_id,
            "Upload completed"
        );

        Ok(UploadOutcome {
            task_id: complete.task_id,
            task_name: complete.task_name,
            instant: false,
            uploaded_bytes: total_size,
        })
    }

    /// Concurrent first pass over the work list.
    /// Returns the retryably-failed indices for the second pass.
    #[allow(clippy::too_many_arguments)]
    async fn first_pass<P: ProgressCallback + 'static>(
        &self,
        request: &UploadRequest,
        work: &[usize],
        chunk_size: u64,
        total_size: u64,
        total_chunks: usize,
        confirmed: &Arc<ConfirmedSet>,
        tracker: &Arc<ProgressTracker>,
        progress: &Arc<P>,
    ) -> UploadResult<Vec<usize>> {
        if work.is_empty() {
            return Ok(Vec::new());
        }

        let budget = failure_budget(work.len(), self.config.failure_tolerance);
        let pool = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut join_set: JoinSet<(usize, Result<ChunkUploadResponse, ApiError>)> =
            JoinSet::new();

        for &index in work {
            let permit = tokio::select! {
                permit = pool.clone().acquire_owned() => {
                    permit.expect("chunk pool closed")
                }
                _ = self.cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(UploadError::Cancelled);
                }
            };

            let api = self.api.clone();
            let path = request.local_path.clone();
            let upload_id = request.upload_id.clone();
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = send_chunk(
                    &api,
                    &path,
                    &upload_id,
                    index,
                    chunk_size,
                    total_size,
                    total_chunks,
                    &cancel,
                )
                .await;
                (index, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((index, result)) = joined else {
                // Aborted task; only happens on cancellation
                continue;
            };
            match result {
                Ok(_response) => {
                    let (bytes, chunks) = confirmed.confirm(index);
                    tracker.set_confirmed(bytes, chunks);
                    tracker.emit(&**progress, UploadPhase::Transferring, false);
                    debug!(
                        target: "uploader",
                        upload_id = %request.upload_id,
                        chunk = index,
                        "Chunk acknowledged"
                    );
                }
                Err(ApiError::Cancelled) => {
                    join_set.abort_all();
                    return Err(UploadError::Cancelled);
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        target: "uploader",
                        upload_id = %request.upload_id,
                        chunk = index,
                        error = %err,
                        "Chunk failed, queued for retry pass"
                    );
                    failed.push(index);
                    if failed.len() > budget {
                        join_set.abort_all();
                        return Err(UploadError::TooManyFailures {
                            failed: failed.len(),
                            tolerance: budget,
                        });
                    }
                }
                Err(err) => {
                    // Validation, resource and fatal errors surface at once
                    join_set.abort_all();
                    return Err(err.into());
                }
            }
        }

        failed.sort_unstable();
        Ok(failed)
    }

    /// Sequential second pass with exponential backoff over retryable
    /// failures only
    #[allow(clippy::too_many_arguments)]
    async fn second_pass<P: ProgressCallback + 'static>(
        &self,
        request: &UploadRequest,
        failed: Vec<usize>,
        chunk_size: u64,
        total_size: u64,
        total_chunks: usize,
        confirmed: &Arc<ConfirmedSet>,
        tracker: &Arc<ProgressTracker>,
        progress: &Arc<P>,
    ) -> UploadResult<()> {
        tracker.emit(&**progress, UploadPhase::Retrying, true);
        let rounds = self.config.retry_rounds.min(self.config.retry_delays.len());
        let delays = &self.config.retry_delays[..rounds];

        for index in failed {
            let mut delivered = false;
            for (attempt, delay_secs) in delays.iter().enumerate() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(*delay_secs)) => {}
                    _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                }

                match send_chunk(
                    &self.api,
                    &request.local_path,
                    &request.upload_id,
                    index,
                    chunk_size,
                    total_size,
                    total_chunks,
                    &self.cancel,
                )
                .await
                {
                    Ok(_response) => {
                        let (bytes, chunks) = confirmed.confirm(index);
                        tracker.set_confirmed(bytes, chunks);
                        tracker.emit(&**progress, UploadPhase::Retrying, true);
                        delivered = true;
                        break;
                    }
                    Err(ApiError::Cancelled) => return Err(UploadError::Cancelled),
                    Err(err) if err.is_retryable() => {
                        warn!(
                            target: "uploader",
                            upload_id = %request.upload_id,
                            chunk = index,
                            attempt = attempt + 1,
                            error = %err,
                            "Retry attempt failed"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if !delivered {
                return Err(UploadError::MaxRetriesExceeded { chunk_index: index });
            }
        }

        Ok(())
    }

    fn check_cancelled(&self) -> UploadResult<()> {
        if self.cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Read one chunk through its own file handle and send it.
///
/// Every attempt opens a fresh handle; a failed attempt never poisons
/// another chunk's reader.
#[allow(clippy::too_many_arguments)]
async fn send_chunk(
    api: &Client,
    path: &PathBuf,
    upload_id: &str,
    index: usize,
    chunk_size: u64,
    total_size: u64,
    total_chunks: usize,
    cancel: &CancellationToken,
) -> Result<ChunkUploadResponse, ApiError> {
    let offset = index as u64 * chunk_size;
    let length = total_size.saturating_sub(offset).min(chunk_size) as usize;

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; length];
    file.read_exact(&mut buffer).await?;

    let tag = fingerprint::digest_bytes(&buffer);

    tokio::select! {
        response = api.upload_chunk(upload_id, index, total_chunks, &tag, Bytes::from(buffer)) => {
            response
        }
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
    }
}

fn boundary_update(phase: UploadPhase, total_size: u64) -> ProgressUpdate {
    ProgressUpdate {
        phase,
        total_size,
        uploaded: 0,
        progress: 0.0,
        speed_bytes_per_sec: 0,
        eta_seconds: None,
        total_chunks: 0,
        completed_chunks: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_budget_floors_at_one() {
        assert_eq!(failure_budget(100, 0.05), 5);
        assert_eq!(failure_budget(10, 0.05), 1);
        assert_eq!(failure_budget(1, 0.05), 1);
        assert_eq!(failure_budget(25, 0.05), 2);
    }

    #[test]
    fn confirmed_set_reports_exact_bytes() {
        // 100 bytes, 30-byte chunks: 4 chunks, last is 10 bytes
        let confirmed = ConfirmedSet::new(BTreeSet::new(), 30, 100);

        assert_eq!(confirmed.confirm(0), (30, 1));
        // The short last chunk contributes its actual size, even out of order
        assert_eq!(confirmed.confirm(3), (40, 2));
        // Re-confirming an index changes nothing
        assert_eq!(confirmed.confirm(3), (40, 2));
        assert_eq!(confirmed.confirm(1), (70, 3));
        assert_eq!(confirmed.confirm(2), (100, 4));
    }

    #[test]
    fn request_ids_are_unique_by_default() {
        let a = UploadRequest::new("/tmp/a.mkv", ConversionParams::new("mp4"));
        let b = UploadRequest::new("/tmp/a.mkv", ConversionParams::new("mp4"));
        assert_ne!(a.upload_id, b.upload_id);

        let fixed = UploadRequest::new("/tmp/a.mkv", ConversionParams::new("mp4"))
            .with_upload_id("stable-id");
        assert_eq!(fixed.upload_id, "stable-id");
    }
}
