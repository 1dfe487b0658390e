use crate::fingerprint::Fingerprint;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use vidforge_api::models::ConversionParams;

/// Manifest persisted as `session.json` inside the session's temp directory.
/// Startup rebuild recovers resumable sessions from these manifests plus the
/// chunk files next to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub upload_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub fingerprint: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub params: ConversionParams,
    pub created_at: i64,
}

/// One in-flight chunked upload.
///
/// The received set and the completion flag are the only mutable state;
/// both use short critical sections so concurrent chunk requests for
/// distinct indices never contend for long.
pub struct UploadSession {
    pub upload_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub fingerprint: Fingerprint,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub params: ConversionParams,
    pub created_at: i64,
    received: Mutex<BTreeSet<usize>>,
    completing: AtomicBool,
    last_activity: AtomicI64,
}

impl UploadSession {
    pub fn new(
        upload_id: String,
        file_name: String,
        total_size: u64,
        fingerprint: Fingerprint,
        chunk_size: u64,
        params: ConversionParams,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            upload_id,
            file_name,
            total_size,
            fingerprint,
            chunk_size,
            total_chunks: Self::calculate_total_chunks(total_size, chunk_size),
            params,
            created_at: now,
            received: Mutex::new(BTreeSet::new()),
            completing: AtomicBool::new(false),
            last_activity: AtomicI64::new(now),
        }
    }

    /// `ceil(total_size / chunk_size)`
    pub fn calculate_total_chunks(total_size: u64, chunk_size: u64) -> usize {
        if total_size == 0 || chunk_size == 0 {
            return 0;
        }
        total_size.div_ceil(chunk_size) as usize
    }

    /// Expected byte length of one chunk: `chunk_size` for every chunk but
    /// the last, the remainder for the last
    pub fn expected_chunk_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.total_size.saturating_sub(start).min(self.chunk_size)
    }

    /// Record a received index. Returns false when the index was already
    /// present (an idempotent re-send).
    pub fn insert_received(&self, index: usize) -> bool {
        self.touch();
        self.received.lock().expect("received set poisoned").insert(index)
    }

    pub fn received_indices(&self) -> Vec<usize> {
        self.received
            .lock()
            .expect("received set poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().expect("received set poisoned").len()
    }

    /// Accurate byte count derived from the received set
    pub fn received_bytes(&self) -> u64 {
        self.received
            .lock()
            .expect("received set poisoned")
            .iter()
            .map(|&index| self.expected_chunk_size(index))
            .sum()
    }

    /// Indices still missing, in order
    pub fn missing_indices(&self) -> Vec<usize> {
        let received = self.received.lock().expect("received set poisoned");
        (0..self.total_chunks)
            .filter(|index| !received.contains(index))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    /// Fraction of chunks received (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received_count() as f64 / self.total_chunks as f64
    }

    /// Enter the completion barrier. Once set, no further chunk writes are
    /// accepted. Returns false if completion had already begun.
    pub fn begin_completion(&self) -> bool {
        !self.completing.swap(true, Ordering::SeqCst)
    }

    /// Leave the completion barrier after a recoverable rejection (missing
    /// chunks), letting the client resume.
    pub fn abort_completion(&self) {
        self.completing.store(false, Ordering::SeqCst);
    }

    pub fn is_completing(&self) -> bool {
        self.completing.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Seconds since the last chunk or status activity
    pub fn idle_seconds(&self) -> i64 {
        (Utc::now().timestamp() - self.last_activity.load(Ordering::SeqCst)).max(0)
    }

    /// Check that a re-init carries the same upload identity
    pub fn matches(
        &self,
        file_name: &str,
        total_size: u64,
        fingerprint: &Fingerprint,
        params: &ConversionParams,
    ) -> bool {
        self.file_name == file_name
            && self.total_size == total_size
            && self.fingerprint == *fingerprint
            && self.params == *params
    }

    pub fn manifest(&self) -> SessionManifest {
        SessionManifest {
            upload_id: self.upload_id.clone(),
            file_name: self.file_name.clone(),
            total_size: self.total_size,
            fingerprint: self.fingerprint.encode(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            params: self.params.clone(),
            created_at: self.created_at,
        }
    }

    /// Rebuild a session from a persisted manifest and the chunk indices
    /// recovered from disk
    pub fn from_manifest(manifest: SessionManifest, received: BTreeSet<usize>) -> Result<Self> {
        let fingerprint = Fingerprint::decode(&manifest.fingerprint)?;
        let session = Self {
            upload_id: manifest.upload_id,
            file_name: manifest.file_name,
            total_size: manifest.total_size,
            fingerprint,
            chunk_size: manifest.chunk_size,
            total_chunks: manifest.total_chunks,
            params: manifest.params,
            created_at: manifest.created_at,
            received: Mutex::new(received),
            completing: AtomicBool::new(false),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
        };
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(
            "u1".to_string(),
            "movie.mkv".to_string(),
            total_size,
            Fingerprint::full("00112233445566778899aabbccddeeff"),
            chunk_size,
            ConversionParams::new("mp4"),
        )
    }

    #[test]
    fn chunk_count_is_ceiling_division() {
        assert_eq!(UploadSession::calculate_total_chunks(100, 30), 4);
        assert_eq!(UploadSession::calculate_total_chunks(90, 30), 3);
        assert_eq!(UploadSession::calculate_total_chunks(1, 30), 1);
        assert_eq!(UploadSession::calculate_total_chunks(0, 30), 0);
    }

    #[test]
    fn exact_multiple_has_no_short_last_chunk() {
        let session = session(90, 30);
        assert_eq!(session.total_chunks, 3);
        for index in 0..3 {
            assert_eq!(session.expected_chunk_size(index), 30);
        }
    }

    #[test]
    fn last_chunk_carries_the_remainder() {
        let session = session(100, 30);
        assert_eq!(session.total_chunks, 4);
        assert_eq!(session.expected_chunk_size(0), 30);
        assert_eq!(session.expected_chunk_size(3), 10);
    }

    #[test]
    fn received_set_is_idempotent_and_accurate() {
        let session = session(100, 30);

        assert!(session.insert_received(0));
        assert!(!session.insert_received(0));
        assert!(session.insert_received(3));

        assert_eq!(session.received_count(), 2);
        assert_eq!(session.received_bytes(), 30 + 10);
        assert_eq!(session.missing_indices(), vec![1, 2]);
        assert!(!session.is_complete());

        session.insert_received(1);
        session.insert_received(2);
        assert!(session.is_complete());
        assert_eq!(session.received_bytes(), 100);
    }

    #[test]
    fn completion_barrier_flips_once() {
        let session = session(10, 30);
        assert!(session.begin_completion());
        assert!(!session.begin_completion());
        session.abort_completion();
        assert!(session.begin_completion());
    }

    #[test]
    fn manifest_round_trip_preserves_received_chunks() {
        let session = session(100, 30);
        session.insert_received(2);

        let manifest = session.manifest();
        let rebuilt = UploadSession::from_manifest(
            manifest,
            session.received_indices().into_iter().collect(),
        )
        .unwrap();

        assert_eq!(rebuilt.total_chunks, 4);
        assert_eq!(rebuilt.received_indices(), vec![2]);
        assert_eq!(rebuilt.fingerprint, session.fingerprint);
    }
}
