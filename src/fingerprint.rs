//! Content fingerprints driving upload deduplication.
//!
//! Files below the configured threshold are identified by a full MD5 over
//! their content (the same digest the wire protocol carries as `fileMd5`).
//! Larger files use a quick fingerprint over `path|size|mtime`, a cheap proxy
//! that is only trusted within the same sender's source tree, so quick
//! fingerprints never match full ones and vice versa.

use anyhow::{Context, Result, anyhow};
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncReadExt;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Which input the digest was computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKind {
    /// MD5 over the whole file content
    Full,
    /// MD5 over the (path, size, mtime) tuple
    Quick,
}

impl FingerprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintKind::Full => "full",
            FingerprintKind::Quick => "quick",
        }
    }
}

/// A content-derived identity for an uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub kind: FingerprintKind,
    /// Lowercase hex digest
    pub value: String,
}

impl Fingerprint {
    pub fn full(value: impl Into<String>) -> Self {
        Self {
            kind: FingerprintKind::Full,
            value: value.into().to_lowercase(),
        }
    }

    pub fn quick(value: impl Into<String>) -> Self {
        Self {
            kind: FingerprintKind::Quick,
            value: value.into().to_lowercase(),
        }
    }

    /// Serialize as `kind:hex` for sidecar files
    pub fn encode(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.value)
    }

    /// Parse the `kind:hex` sidecar form
    pub fn decode(text: &str) -> Result<Self> {
        let (kind, value) = text
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("Malformed fingerprint record: {text}"))?;
        match kind {
            "full" => Ok(Self::full(value)),
            "quick" => Ok(Self::quick(value)),
            other => Err(anyhow!("Unknown fingerprint kind: {other}")),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// MD5 over an in-memory buffer, lowercase hex
pub fn digest_bytes(bytes: &[u8]) -> String {
    to_hex(&Md5::digest(bytes))
}

/// MD5 over the whole file content
pub async fn compute_full(path: &Path) -> Result<Fingerprint> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(Fingerprint::full(to_hex(&hasher.finalize())))
}

/// Quick fingerprint over the (path, size, mtime) tuple
pub async fn compute_quick(path: &Path) -> Result<Fingerprint> {
    let metadata = fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let mtime = metadata
        .modified()
        .context("Filesystem does not report modification times")?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let input = format!("{}|{}|{}", path.display(), metadata.len(), mtime);
    Ok(Fingerprint::quick(digest_bytes(input.as_bytes())))
}

/// Compute the fingerprint for a file, selecting the hash input by the
/// quick-fingerprint threshold
pub async fn compute_file(path: &Path, size: u64, quick_threshold: u64) -> Result<Fingerprint> {
    if size >= quick_threshold {
        compute_quick(path).await
    } else {
        compute_full(path).await
    }
}

/// Sidecar path recording an artifact's fingerprint
fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut os = artifact.as_os_str().to_owned();
    os.push(".fp");
    PathBuf::from(os)
}

/// Record an artifact's fingerprint next to it
pub async fn write_sidecar(artifact: &Path, fingerprint: &Fingerprint) -> Result<()> {
    fs::write(sidecar_path(artifact), fingerprint.encode())
        .await
        .with_context(|| format!("Failed to write fingerprint for {}", artifact.display()))
}

/// Read an artifact's recorded fingerprint, if present
pub async fn read_sidecar(artifact: &Path) -> Result<Option<Fingerprint>> {
    let path = sidecar_path(artifact);
    match fs::read_to_string(&path).await {
        Ok(text) => Ok(Some(Fingerprint::decode(&text)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Scan the uploads directory for an artifact with the same size and
/// fingerprint. This is what makes "instant upload" possible: a match means
/// the content is already present and no chunk transfer is needed.
pub async fn matching_artifact(
    uploads_dir: &Path,
    fingerprint: &Fingerprint,
    size: u64,
) -> Result<Option<PathBuf>> {
    let mut entries = match fs::read_dir(uploads_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to scan {}", uploads_dir.display()));
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "fp" || ext == "part") {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if !metadata.is_file() || metadata.len() != size {
            continue;
        }
        if let Some(recorded) = read_sidecar(&path).await.unwrap_or(None) {
            if recorded == *fingerprint {
                tracing::debug!(
                    target: "ingest",
                    artifact = %path.display(),
                    "Fingerprint match found"
                );
                return Ok(Some(path));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn digest_matches_known_vector() {
        assert_eq!(digest_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn sidecar_form_round_trips() {
        let fp = Fingerprint::full("900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(Fingerprint::decode(&fp.encode()).unwrap(), fp);

        let quick = Fingerprint::quick("aabbccdd");
        assert_eq!(Fingerprint::decode(&quick.encode()).unwrap(), quick);
        assert!(Fingerprint::decode("nonsense").is_err());
    }

    #[tokio::test]
    async fn full_fingerprint_depends_only_on_content() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        tokio::fs::write(&a, b"same bytes").await.unwrap();
        tokio::fs::write(&b, b"same bytes").await.unwrap();

        let fp_a = compute_full(&a).await.unwrap();
        let fp_b = compute_full(&b).await.unwrap();
        assert_eq!(fp_a, fp_b);
        assert_eq!(fp_a.kind, FingerprintKind::Full);
    }

    #[tokio::test]
    async fn threshold_selects_quick_fingerprint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        tokio::fs::write(&path, vec![0u8; 128]).await.unwrap();

        let fp = compute_file(&path, 128, 64).await.unwrap();
        assert_eq!(fp.kind, FingerprintKind::Quick);

        let fp = compute_file(&path, 128, 1024).await.unwrap();
        assert_eq!(fp.kind, FingerprintKind::Full);
    }

    #[tokio::test]
    async fn matching_artifact_requires_equal_size_and_kind() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("u1_movie.mkv");
        tokio::fs::write(&artifact, b"video payload").await.unwrap();

        let fp = compute_full(&artifact).await.unwrap();
        write_sidecar(&artifact, &fp).await.unwrap();

        let found = matching_artifact(dir.path(), &fp, 13).await.unwrap();
        assert_eq!(found, Some(artifact.clone()));

        // Size mismatch: no match
        assert!(matching_artifact(dir.path(), &fp, 14).await.unwrap().is_none());

        // Quick fingerprint with the same hex never matches a full record
        let quick = Fingerprint::quick(fp.value.clone());
        assert!(
            matching_artifact(dir.path(), &quick, 13)
                .await
                .unwrap()
                .is_none()
        );
    }
}
