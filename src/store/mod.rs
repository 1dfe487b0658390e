//! Server-side chunk staging and artifact assembly.
//!
//! Chunks are persisted one file per index under the session's temp
//! directory; merge streams them back in index order into a single artifact.
//! Keeping write and merge separate makes per-chunk upload idempotent and
//! crash-safe: a re-written chunk overwrites byte-identical content, and the
//! merge is deterministic from whatever set of chunks survived.

use crate::fingerprint::{self, Fingerprint};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Streaming buffer for merge reads (1 MiB)
const MERGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Result type for chunk store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Chunk store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// Chunk payload did not match its integrity tag; nothing was persisted
    #[error("Chunk {chunk_index} integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        chunk_index: usize,
        expected: String,
        actual: String,
    },

    /// A chunk required for merge is not on disk
    #[error("Chunk {chunk_index} is missing")]
    MissingChunk { chunk_index: usize },

    /// Merged artifact size differs from the declared total
    #[error("Artifact size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Merged artifact fingerprint differs from the declared fingerprint
    #[error("Artifact fingerprint mismatch")]
    FingerprintMismatch,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Filesystem layout and blob operations for chunked uploads
#[derive(Debug, Clone)]
pub struct ChunkStore {
    temp_root: PathBuf,
    uploads_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(temp_root: PathBuf, uploads_dir: PathBuf) -> Self {
        Self {
            temp_root,
            uploads_dir,
        }
    }

    /// Temp directory owned by one upload session
    pub fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.temp_root.join(upload_id)
    }

    /// Path of one chunk blob: `<tempdir>/chunk_<index:06>`
    pub fn chunk_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.session_dir(upload_id).join(format!("chunk_{index:06}"))
    }

    /// Final artifact path: `<uploads>/<uploadId>_<fileName>`
    pub fn artifact_path(&self, upload_id: &str, file_name: &str) -> PathBuf {
        self.uploads_dir.join(format!("{upload_id}_{file_name}"))
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Persist one chunk atomically.
    ///
    /// When an integrity tag is supplied it is verified before anything
    /// touches disk; a mismatch persists nothing. The blob is written to a
    /// `.part` file and renamed into place, so a crash never leaves a
    /// half-written chunk under its final name. Re-sending an index simply
    /// overwrites byte-identical content.
    pub async fn write_chunk(
        &self,
        upload_id: &str,
        index: usize,
        bytes: &[u8],
        expected_md5: Option<&str>,
    ) -> StoreResult<()> {
        if let Some(expected) = expected_md5 {
            let actual = fingerprint::digest_bytes(bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(
                    target: "store",
                    upload_id = %upload_id,
                    chunk = index,
                    "Chunk integrity tag mismatch"
                );
                return Err(StoreError::IntegrityMismatch {
                    chunk_index: index,
                    expected: expected.to_lowercase(),
                    actual,
                });
            }
        }

        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;

        let final_path = self.chunk_path(upload_id, index);
        let part_path = final_path.with_extension("part");

        let mut file = fs::File::create(&part_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&part_path, &final_path).await?;

        debug!(
            target: "store",
            upload_id = %upload_id,
            chunk = index,
            bytes = bytes.len(),
            "Chunk persisted"
        );
        Ok(())
    }

    /// Recover the set of persisted chunk indices from disk.
    /// Used to rebuild resumable sessions after a restart.
    pub async fn scan_chunks(&self, upload_id: &str) -> StoreResult<BTreeSet<usize>> {
        let dir = self.session_dir(upload_id);
        let mut indices = BTreeSet::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_prefix("chunk_")
                .and_then(|rest| rest.parse::<usize>().ok())
            {
                indices.insert(index);
            }
        }

        Ok(indices)
    }

    /// Concatenate chunks `0..chunk_count` in index order into the artifact.
    ///
    /// The artifact is assembled in a `.part` file and renamed on success; a
    /// missing chunk aborts the merge and removes the partial file, so no
    /// truncated artifact ever appears under the final name.
    pub async fn merge(
        &self,
        upload_id: &str,
        file_name: &str,
        chunk_count: usize,
    ) -> StoreResult<PathBuf> {
        fs::create_dir_all(&self.uploads_dir).await?;

        let artifact = self.artifact_path(upload_id, file_name);
        let part_path = artifact.with_extension("part");

        let result = self
            .merge_into(upload_id, chunk_count, &part_path)
            .await;

        match result {
            Ok(total_bytes) => {
                fs::rename(&part_path, &artifact).await?;
                info!(
                    target: "store",
                    upload_id = %upload_id,
                    artifact = %artifact.display(),
                    bytes = total_bytes,
                    chunks = chunk_count,
                    "Chunks merged into artifact"
                );
                Ok(artifact)
            }
            Err(err) => {
                let _ = fs::remove_file(&part_path).await;
                Err(err)
            }
        }
    }

    async fn merge_into(
        &self,
        upload_id: &str,
        chunk_count: usize,
        dest: &Path,
    ) -> StoreResult<u64> {
        let mut output = fs::File::create(dest).await?;
        let mut total_bytes = 0u64;

        for index in 0..chunk_count {
            let chunk_path = self.chunk_path(upload_id, index);
            let chunk_file = match fs::File::open(&chunk_path).await {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::MissingChunk { chunk_index: index });
                }
                Err(err) => return Err(err.into()),
            };

            let mut reader = BufReader::with_capacity(MERGE_BUFFER_SIZE, chunk_file);
            total_bytes += tokio::io::copy_buf(&mut reader, &mut output).await?;
        }

        output.flush().await?;
        Ok(total_bytes)
    }

    /// Validate the merged artifact. Size is always checked; the fingerprint
    /// check runs only when a fingerprint is supplied (it re-reads the file).
    pub async fn validate_final(
        &self,
        path: &Path,
        expected_size: u64,
        expected_fingerprint: Option<&Fingerprint>,
    ) -> StoreResult<()> {
        let metadata = fs::metadata(path).await?;
        if metadata.len() != expected_size {
            return Err(StoreError::SizeMismatch {
                expected: expected_size,
                actual: metadata.len(),
            });
        }

        if let Some(expected) = expected_fingerprint {
            let actual = fingerprint::compute_full(path).await?;
            if actual.value != expected.value {
                return Err(StoreError::FingerprintMismatch);
            }
        }

        Ok(())
    }

    /// Remove a session's entire temp directory
    pub async fn remove_session_dir(&self, upload_id: &str) -> StoreResult<()> {
        let dir = self.session_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> ChunkStore {
        ChunkStore::new(dir.join("temp"), dir.join("uploads"))
    }

    #[tokio::test]
    async fn write_chunk_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.write_chunk("u1", 0, b"payload", None).await.unwrap();
        store.write_chunk("u1", 0, b"payload", None).await.unwrap();

        let chunks = store.scan_chunks("u1").await.unwrap();
        assert_eq!(chunks.into_iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(
            tokio::fs::read(store.chunk_path("u1", 0)).await.unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn integrity_mismatch_persists_nothing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let err = store
            .write_chunk("u1", 3, b"payload", Some("00000000000000000000000000000000"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::IntegrityMismatch { chunk_index: 3, .. }
        ));
        assert!(store.scan_chunks("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_tag_is_accepted() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let tag = crate::fingerprint::digest_bytes(b"payload");
        store
            .write_chunk("u1", 0, b"payload", Some(&tag))
            .await
            .unwrap();
        assert_eq!(store.scan_chunks("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn merge_concatenates_in_index_order() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        // Write out of order; merge must still produce index order
        store.write_chunk("u1", 1, b"world", None).await.unwrap();
        store.write_chunk("u1", 0, b"hello ", None).await.unwrap();

        let artifact = store.merge("u1", "greeting.txt", 2).await.unwrap();
        assert_eq!(tokio::fs::read(&artifact).await.unwrap(), b"hello world");
        assert!(artifact.ends_with("u1_greeting.txt"));
    }

    #[tokio::test]
    async fn merge_with_missing_chunk_leaves_no_artifact() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.write_chunk("u1", 0, b"aaaa", None).await.unwrap();
        store.write_chunk("u1", 2, b"cccc", None).await.unwrap();

        let err = store.merge("u1", "file.bin", 3).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingChunk { chunk_index: 1 }));
        assert!(!store.artifact_path("u1", "file.bin").exists());
        assert!(!store.artifact_path("u1", "file.bin").with_extension("part").exists());
    }

    #[tokio::test]
    async fn validate_final_checks_size_and_fingerprint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.write_chunk("u1", 0, b"0123456789", None).await.unwrap();
        let artifact = store.merge("u1", "digits.bin", 1).await.unwrap();

        store.validate_final(&artifact, 10, None).await.unwrap();

        let err = store.validate_final(&artifact, 11, None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SizeMismatch {
                expected: 11,
                actual: 10
            }
        ));

        let fp = Fingerprint::full(crate::fingerprint::digest_bytes(b"0123456789"));
        store.validate_final(&artifact, 10, Some(&fp)).await.unwrap();

        let wrong = Fingerprint::full("ffffffffffffffffffffffffffffffff");
        let err = store
            .validate_final(&artifact, 10, Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FingerprintMismatch));
    }

    #[tokio::test]
    async fn remove_session_dir_is_tolerant_of_absence() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.write_chunk("u1", 0, b"x", None).await.unwrap();
        store.remove_session_dir("u1").await.unwrap();
        assert!(!store.session_dir("u1").exists());

        // Second eviction is a no-op
        store.remove_session_dir("u1").await.unwrap();
    }
}
