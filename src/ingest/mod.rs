//! Upload session management.
//!
//! One state machine per upload: init opens a session (gated on admission
//! and deduplication), chunks land idempotently, completion merges and hands
//! the artifact to the conversion engine. Sessions live in a concurrent map
//! with a `session.json` manifest on disk, so a restart rebuilds whatever
//! was resumable.

mod session;

pub use session::{SessionManifest, UploadSession};

use crate::fingerprint::{self, Fingerprint, FingerprintKind};
use crate::space::{DiskBudget, UsageCategory};
use crate::store::{ChunkStore, StoreError};
use crate::tasks::ConversionEngine;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use vidforge_api::models::{
    ChunkUploadResponse, CompleteUploadResponse, ConversionParams, InitUploadRequest,
    InitUploadResponse, UploadStatusResponse,
};

/// Result type for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Ingest error types
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),

    #[error("File size {size} exceeds the per-file cap of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientSpace {
        required: u64,
        available: u64,
        details: String,
    },

    #[error("Unknown upload session: {0}")]
    SessionNotFound(String),

    #[error("Session {0} already exists with different parameters")]
    ParamsMismatch(String),

    #[error("Chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: usize, total: usize },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Session {0} is completing; no further chunks are accepted")]
    CompletionInProgress(String),

    #[error("Session is missing {} chunk(s)", missing.len())]
    Incomplete { missing: Vec<usize> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Ingest configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub chunk_size: u64,
    pub max_file_size: u64,
    pub quick_fingerprint_threshold: u64,
    pub verify_final_fingerprint: bool,
    pub session_ttl: Duration,
}

/// Per-upload state machines behind a concurrent map
pub struct SessionManager {
    store: ChunkStore,
    budget: Arc<DiskBudget>,
    engine: Arc<ConversionEngine>,
    config: IngestConfig,
    sessions: DashMap<String, Arc<UploadSession>>,
}

impl SessionManager {
    pub fn new(
        store: ChunkStore,
        budget: Arc<DiskBudget>,
        engine: Arc<ConversionEngine>,
        config: IngestConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            budget,
            engine,
            config,
            sessions: DashMap::new(),
        })
    }

    /// Open a session, or short-circuit when the content already exists.
    ///
    /// Re-init with identical parameters is idempotent and returns the same
    /// session view; a parameter mismatch is a conflict.
    pub async fn init(&self, request: InitUploadRequest) -> IngestResult<InitUploadResponse> {
        self.validate_init(&request)?;

        let fingerprint = self.fingerprint_from_request(&request);

        if let Some(existing) = self.sessions.get(&request.upload_id) {
            let session = existing.value().clone();
            drop(existing);
            if session.matches(
                &request.file_name,
                request.file_size,
                &fingerprint,
                &request.conversion_request,
            ) {
                debug!(
                    target: "ingest",
                    upload_id = %request.upload_id,
                    "Re-init of existing session"
                );
                session.touch();
                return Ok(InitUploadResponse {
                    chunk_size: session.chunk_size,
                    total_chunks: session.total_chunks,
                    file_exists: false,
                    task_id: None,
                    task_name: None,
                });
            }
            return Err(IngestError::ParamsMismatch(request.upload_id));
        }

        // Instant upload: matching artifact means no transfer at all
        if let Some(artifact) = fingerprint::matching_artifact(
            self.store.uploads_dir(),
            &fingerprint,
            request.file_size,
        )
        .await?
        {
            let task = self
                .engine
                .create_task(
                    &artifact,
                    &request.file_name,
                    request.file_size,
                    request.conversion_request.clone(),
                    Some(request.upload_id.clone()),
                    None,
                )
                .map_err(IngestError::Other)?;

            info!(
                target: "ingest",
                upload_id = %request.upload_id,
                task_id = %task.id,
                "Instant upload: content already present"
            );

            return Ok(InitUploadResponse {
                chunk_size: self.config.chunk_size,
                total_chunks: 0,
                file_exists: true,
                task_id: Some(task.id),
                task_name: Some(task.task_name),
            });
        }

        // Admission gate
        let admission = self
            .budget
            .check_ingest(request.file_size, &request.conversion_request)
            .await;
        if !admission.has_enough_space {
            return Err(IngestError::InsufficientSpace {
                required: admission.required_space,
                available: admission.available_space,
                details: admission.details,
            });
        }

        let session = Arc::new(UploadSession::new(
            request.upload_id.clone(),
            request.file_name.clone(),
            request.file_size,
            fingerprint,
            self.config.chunk_size,
            request.conversion_request.clone(),
        ));

        self.persist_manifest(&session).await?;
        let response = InitUploadResponse {
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            file_exists: false,
            task_id: None,
            task_name: None,
        };

        info!(
            target: "ingest",
            upload_id = %request.upload_id,
            file = %request.file_name,
            size = request.file_size,
            chunks = session.total_chunks,
            "Upload session opened"
        );
        self.sessions.insert(request.upload_id, session);
        Ok(response)
    }

    fn validate_init(&self, request: &InitUploadRequest) -> IngestResult<()> {
        if request.upload_id.trim().is_empty() {
            return Err(IngestError::Validation("uploadId must not be empty".to_string()));
        }
        if request.file_name.trim().is_empty() {
            return Err(IngestError::Validation("fileName must not be empty".to_string()));
        }
        if request.file_name.contains('/')
            || request.file_name.contains('\\')
            || request.file_name.contains("..")
        {
            return Err(IngestError::Validation(
                "fileName must not contain path separators".to_string(),
            ));
        }
        if request.file_size == 0 {
            return Err(IngestError::Validation(
                "Zero-byte files are not accepted".to_string(),
            ));
        }
        if request.file_size > self.config.max_file_size {
            return Err(IngestError::FileTooLarge {
                size: request.file_size,
                max: self.config.max_file_size,
            });
        }
        if request.file_md5.trim().is_empty() {
            return Err(IngestError::Validation("fileMd5 must not be empty".to_string()));
        }
        Ok(())
    }

    /// The threshold rule both sides apply: the digest in the request is a
    /// full content hash below the threshold, a quick tuple hash at or above
    fn fingerprint_from_request(&self, request: &InitUploadRequest) -> Fingerprint {
        if request.file_size >= self.config.quick_fingerprint_threshold {
            Fingerprint::quick(request.file_md5.clone())
        } else {
            Fingerprint::full(request.file_md5.clone())
        }
    }

    /// Accept one chunk. Idempotent per index; rejected once completion has
    /// begun.
    pub async fn accept_chunk(
        &self,
        upload_id: &str,
        index: usize,
        bytes: &[u8],
        chunk_md5: Option<&str>,
    ) -> IngestResult<ChunkUploadResponse> {
        let session = self.get_session(upload_id)?;

        if session.is_completing() {
            return Err(IngestError::CompletionInProgress(upload_id.to_string()));
        }
        if index >= session.total_chunks {
            return Err(IngestError::ChunkOutOfRange {
                index,
                total: session.total_chunks,
            });
        }

        let expected = session.expected_chunk_size(index);
        if bytes.len() as u64 != expected {
            return Err(IngestError::ChunkSizeMismatch {
                index,
                expected,
                actual: bytes.len() as u64,
            });
        }

        self.store
            .write_chunk(upload_id, index, bytes, chunk_md5)
            .await?;

        if session.insert_received(index) {
            self.budget
                .update_usage(bytes.len() as i64, UsageCategory::Temp)
                .await;
        }

        Ok(ChunkUploadResponse {
            chunk_index: index,
            uploaded_chunks: session.received_count(),
            total_chunks: session.total_chunks,
            progress: session.progress(),
        })
    }

    /// Received-set snapshot used by clients to resume
    pub fn status(&self, upload_id: &str) -> IngestResult<UploadStatusResponse> {
        let session = self.get_session(upload_id)?;
        session.touch();
        Ok(UploadStatusResponse {
            uploaded_chunks: session.received_indices(),
            total_chunks: session.total_chunks,
            uploaded_bytes: session.received_bytes(),
            total_bytes: session.total_size,
            progress: session.progress(),
        })
    }

    /// Finalize: merge, validate, hand off to conversion, evict the session.
    ///
    /// Not idempotent by design; once completion succeeds the session is
    /// gone and a second call sees an unknown session.
    pub async fn complete(&self, upload_id: &str) -> IngestResult<CompleteUploadResponse> {
        let session = self.get_session(upload_id)?;

        if !session.begin_completion() {
            return Err(IngestError::CompletionInProgress(upload_id.to_string()));
        }

        let missing = session.missing_indices();
        if !missing.is_empty() {
            session.abort_completion();
            return Err(IngestError::Incomplete { missing });
        }

        let result = self.merge_and_hand_off(&session).await;
        match result {
            Ok(response) => {
                self.sessions.remove(upload_id);
                let staged = session.received_bytes();
                if let Err(err) = self.store.remove_session_dir(upload_id).await {
                    warn!(
                        target: "ingest",
                        upload_id = %upload_id,
                        error = %err,
                        "Failed to remove session temp directory"
                    );
                }
                self.budget
                    .update_usage(-(staged as i64), UsageCategory::Temp)
                    .await;
                Ok(response)
            }
            Err(err) => {
                // Merge and validation failures are fatal for the session;
                // the temp area is purged and the client starts over
                warn!(
                    target: "ingest",
                    upload_id = %upload_id,
                    error = %err,
                    "Completion failed, evicting session"
                );
                self.evict(upload_id, &session).await;
                Err(err)
            }
        }
    }

    async fn merge_and_hand_off(
        &self,
        session: &Arc<UploadSession>,
    ) -> IngestResult<CompleteUploadResponse> {
        let artifact = self
            .store
            .merge(&session.upload_id, &session.file_name, session.total_chunks)
            .await?;

        let verify_fingerprint = (self.config.verify_final_fingerprint
            && session.fingerprint.kind == FingerprintKind::Full)
            .then_some(&session.fingerprint);
        self.store
            .validate_final(&artifact, session.total_size, verify_fingerprint)
            .await?;

        fingerprint::write_sidecar(&artifact, &session.fingerprint).await?;
        self.budget
            .update_usage(session.total_size as i64, UsageCategory::Uploaded)
            .await;

        let task = self
            .engine
            .create_task(
                &artifact,
                &session.file_name,
                session.total_size,
                session.params.clone(),
                Some(session.upload_id.clone()),
                None,
            )
            .map_err(IngestError::Other)?;

        info!(
            target: "ingest",
            upload_id = %session.upload_id,
            task_id = %task.id,
            "Upload complete, conversion task created"
        );

        Ok(CompleteUploadResponse {
            task_id: task.id,
            task_name: task.task_name,
            message: "Upload complete; conversion queued".to_string(),
        })
    }

    fn get_session(&self, upload_id: &str) -> IngestResult<Arc<UploadSession>> {
        self.sessions
            .get(upload_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| IngestError::SessionNotFound(upload_id.to_string()))
    }

    /// Abort a session from any non-terminal state, purging its temp area
    pub async fn abort(&self, upload_id: &str) -> IngestResult<()> {
        let session = self.get_session(upload_id)?;
        self.evict(upload_id, &session).await;
        info!(target: "ingest", upload_id = %upload_id, "Session aborted");
        Ok(())
    }

    async fn evict(&self, upload_id: &str, session: &Arc<UploadSession>) {
        self.sessions.remove(upload_id);
        let staged = session.received_bytes();
        if let Err(err) = self.store.remove_session_dir(upload_id).await {
            warn!(
                target: "ingest",
                upload_id = %upload_id,
                error = %err,
                "Failed to purge session temp directory"
            );
        }
        if staged > 0 {
            self.budget
                .update_usage(-(staged as i64), UsageCategory::Temp)
                .await;
        }
    }

    /// Evict every session idle longer than the TTL. Returns how many went.
    pub async fn evict_expired(&self) -> usize {
        let ttl_seconds = self.config.session_ttl.as_secs() as i64;
        let expired: Vec<(String, Arc<UploadSession>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_seconds() >= ttl_seconds)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let count = expired.len();
        for (upload_id, session) in expired {
            info!(
                target: "ingest",
                upload_id = %upload_id,
                idle_seconds = session.idle_seconds(),
                "Evicting idle session"
            );
            self.evict(&upload_id, &session).await;
        }
        count
    }

    /// Background TTL sweeper
    pub fn spawn_ttl_sweeper(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = manager.evict_expired().await;
                if evicted > 0 {
                    info!(
                        target: "ingest",
                        count = evicted,
                        "TTL sweep evicted idle sessions"
                    );
                }
            }
        });
    }

    /// Rebuild resumable sessions from the temp directory at startup
    pub async fn rebuild_from_disk(&self) -> anyhow::Result<usize> {
        let mut entries = match fs::read_dir(self.store.temp_root()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut rebuilt = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let manifest_path = entry.path().join("session.json");
            let manifest: SessionManifest = match fs::read_to_string(&manifest_path).await {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        warn!(
                            target: "ingest",
                            path = %manifest_path.display(),
                            error = %err,
                            "Skipping unreadable session manifest"
                        );
                        continue;
                    }
                },
                Err(_) => continue,
            };

            let upload_id = manifest.upload_id.clone();
            let received = self.store.scan_chunks(&upload_id).await?;
            match UploadSession::from_manifest(manifest, received) {
                Ok(session) => {
                    let staged = session.received_bytes();
                    if staged > 0 {
                        self.budget
                            .update_usage(staged as i64, UsageCategory::Temp)
                            .await;
                    }
                    self.sessions.insert(upload_id, Arc::new(session));
                    rebuilt += 1;
                }
                Err(err) => {
                    warn!(
                        target: "ingest",
                        upload_id = %upload_id,
                        error = %err,
                        "Failed to rebuild session"
                    );
                }
            }
        }

        if rebuilt > 0 {
            info!(
                target: "ingest",
                count = rebuilt,
                "Rebuilt resumable upload sessions from disk"
            );
        }
        Ok(rebuilt)
    }

    async fn persist_manifest(&self, session: &UploadSession) -> IngestResult<()> {
        let dir = self.store.session_dir(&session.upload_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| IngestError::Store(err.into()))?;
        let manifest = serde_json::to_vec_pretty(&session.manifest())
            .map_err(|err| IngestError::Other(err.into()))?;
        fs::write(dir.join("session.json"), manifest)
            .await
            .map_err(|err| IngestError::Store(err.into()))?;
        Ok(())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::push::PushBus;
    use crate::tasks::{Encoder, EncoderConfig, EngineConfig};
    use tempfile::tempdir;
    use vidforge_api::models::{DiskSpaceConfig, TaskStatus};

    struct Fixture {
        manager: Arc<SessionManager>,
        engine: Arc<ConversionEngine>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        fixture_with(|config| config).await
    }

    async fn fixture_with(adjust: impl FnOnce(IngestConfig) -> IngestConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let push = PushBus::new(64);
        let budget = Arc::new(
            DiskBudget::new(
                db.clone(),
                push.clone(),
                dir.path().join("uploads"),
                dir.path().join("outputs"),
                dir.path().join("temp"),
                DiskSpaceConfig::default(),
            )
            .unwrap(),
        );
        let engine = ConversionEngine::new(
            db,
            push,
            budget.clone(),
            Encoder::new(EncoderConfig::default()),
            EngineConfig {
                outputs_dir: dir.path().join("outputs"),
                ..Default::default()
            },
        );
        let store = ChunkStore::new(dir.path().join("temp"), dir.path().join("uploads"));
        let config = adjust(IngestConfig {
            chunk_size: 8,
            max_file_size: 1024,
            quick_fingerprint_threshold: 512,
            verify_final_fingerprint: false,
            session_ttl: Duration::from_secs(24 * 3600),
        });
        Fixture {
            manager: SessionManager::new(store, budget, engine.clone(), config),
            engine,
            _dir: dir,
        }
    }

    fn init_request(upload_id: &str, payload: &[u8]) -> InitUploadRequest {
        InitUploadRequest {
            upload_id: upload_id.to_string(),
            file_name: "movie.mkv".to_string(),
            file_size: payload.len() as u64,
            file_md5: crate::fingerprint::digest_bytes(payload),
            conversion_request: ConversionParams::new("mp4"),
        }
    }

    #[tokio::test]
    async fn full_upload_round_trip() {
        let fixture = fixture().await;
        let payload = b"0123456789abcdef0123"; // 20 bytes, chunk size 8 -> 3 chunks

        let init = fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();
        assert_eq!(init.total_chunks, 3);
        assert!(!init.file_exists);

        for (index, chunk) in payload.chunks(8).enumerate() {
            let response = fixture
                .manager
                .accept_chunk("u1", index, chunk, None)
                .await
                .unwrap();
            assert_eq!(response.chunk_index, index);
        }

        let status = fixture.manager.status("u1").unwrap();
        assert_eq!(status.uploaded_chunks, vec![0, 1, 2]);
        assert_eq!(status.uploaded_bytes, 20);

        let complete = fixture.manager.complete("u1").await.unwrap();
        assert!(!complete.task_id.is_empty());

        // Task exists and references the merged artifact
        let task = fixture
            .engine
            .get_task(&complete.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.original_file_size, 20);
        assert_eq!(
            tokio::fs::read(&task.artifact_path).await.unwrap(),
            payload
        );

        // Session is gone: complete is not idempotent
        assert!(matches!(
            fixture.manager.complete("u1").await,
            Err(IngestError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn re_init_is_idempotent_and_mismatch_conflicts() {
        let fixture = fixture().await;
        let payload = b"0123456789";

        let first = fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();
        let again = fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();
        assert_eq!(first.total_chunks, again.total_chunks);
        assert_eq!(fixture.manager.session_count(), 1);

        let mut different = init_request("u1", payload);
        different.conversion_request = ConversionParams::new("webm");
        assert!(matches!(
            fixture.manager.init(different).await,
            Err(IngestError::ParamsMismatch(_))
        ));
    }

    #[tokio::test]
    async fn zero_byte_and_oversized_files_are_rejected() {
        let fixture = fixture().await;

        let mut request = init_request("u1", b"");
        request.file_size = 0;
        assert!(matches!(
            fixture.manager.init(request).await,
            Err(IngestError::Validation(_))
        ));

        let mut request = init_request("u2", b"x");
        request.file_size = 4096;
        assert!(matches!(
            fixture.manager.init(request).await,
            Err(IngestError::FileTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn chunk_validation_rejects_bad_indices_and_sizes() {
        let fixture = fixture().await;
        let payload = b"0123456789"; // 2 chunks of 8+2

        fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();

        assert!(matches!(
            fixture.manager.accept_chunk("u1", 5, b"01234567", None).await,
            Err(IngestError::ChunkOutOfRange { index: 5, total: 2 })
        ));
        assert!(matches!(
            fixture.manager.accept_chunk("u1", 0, b"tiny", None).await,
            Err(IngestError::ChunkSizeMismatch { index: 0, .. })
        ));
        assert!(matches!(
            fixture.manager.accept_chunk("ghost", 0, b"01234567", None).await,
            Err(IngestError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resent_chunk_does_not_change_state() {
        let fixture = fixture().await;
        let payload = b"0123456789";
        fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();

        let first = fixture
            .manager
            .accept_chunk("u1", 0, &payload[..8], None)
            .await
            .unwrap();
        let second = fixture
            .manager
            .accept_chunk("u1", 0, &payload[..8], None)
            .await
            .unwrap();
        assert_eq!(first.uploaded_chunks, 1);
        assert_eq!(second.uploaded_chunks, 1);
    }

    #[tokio::test]
    async fn complete_with_missing_chunks_is_recoverable() {
        let fixture = fixture().await;
        let payload = b"0123456789abcdef0123";
        fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();

        fixture
            .manager
            .accept_chunk("u1", 0, &payload[..8], None)
            .await
            .unwrap();

        match fixture.manager.complete("u1").await {
            Err(IngestError::Incomplete { missing }) => assert_eq!(missing, vec![1, 2]),
            other => panic!("unexpected result: {other:?}"),
        }

        // The failed completion released the barrier; the client can resume
        fixture
            .manager
            .accept_chunk("u1", 1, &payload[8..16], None)
            .await
            .unwrap();
        fixture
            .manager
            .accept_chunk("u1", 2, &payload[16..], None)
            .await
            .unwrap();
        fixture.manager.complete("u1").await.unwrap();
    }

    #[tokio::test]
    async fn instant_upload_matches_existing_artifact() {
        let fixture = fixture().await;
        let payload = b"identical content!";

        // First upload plants the artifact and its fingerprint sidecar
        fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();
        for (index, chunk) in payload.chunks(8).enumerate() {
            fixture
                .manager
                .accept_chunk("u1", index, chunk, None)
                .await
                .unwrap();
        }
        fixture.manager.complete("u1").await.unwrap();

        // Same content under a new upload id: no chunk transfer needed
        let init = fixture
            .manager
            .init(init_request("u2", payload))
            .await
            .unwrap();
        assert!(init.file_exists);
        assert!(init.task_id.is_some());
        assert_eq!(fixture.manager.session_count(), 0);
    }

    #[tokio::test]
    async fn ttl_eviction_purges_idle_sessions() {
        let fixture = fixture_with(|mut config| {
            config.session_ttl = Duration::from_secs(0);
            config
        })
        .await;
        let payload = b"0123456789";
        fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();
        fixture
            .manager
            .accept_chunk("u1", 0, &payload[..8], None)
            .await
            .unwrap();

        assert_eq!(fixture.manager.evict_expired().await, 1);
        assert_eq!(fixture.manager.session_count(), 0);
        assert!(matches!(
            fixture.manager.status("u1"),
            Err(IngestError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rebuild_recovers_sessions_from_manifests() {
        let fixture = fixture().await;
        let payload = b"0123456789abcdef0123";
        fixture
            .manager
            .init(init_request("u1", payload))
            .await
            .unwrap();
        fixture
            .manager
            .accept_chunk("u1", 1, &payload[8..16], None)
            .await
            .unwrap();

        // Simulate a restart: a fresh manager over the same store
        let store = fixture.manager.store.clone();
        let rebuilt_manager = SessionManager::new(
            store,
            fixture.manager.budget.clone(),
            fixture.engine.clone(),
            fixture.manager.config.clone(),
        );
        assert_eq!(rebuilt_manager.rebuild_from_disk().await.unwrap(), 1);

        let status = rebuilt_manager.status("u1").unwrap();
        assert_eq!(status.uploaded_chunks, vec![1]);
        assert_eq!(status.total_chunks, 3);
    }
}
