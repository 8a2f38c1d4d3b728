//! File artifacts, identifiers, and content hashing.
//!
//! An artifact is one processing attempt on one file. It carries the bytes
//! (on disk or in memory), a declared MIME class, and a size; the content
//! hash over its bytes is the cache and duplicate-detection key. Hashing is
//! chunked so arbitrarily large files never inflate the heap.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{DispatchError, Result};

/// Hashing reads the file in chunks of this size.
const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// Declared MIME class of an artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactClass {
    Image,
    Pdf,
    Video,
}

impl ArtifactClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Video => "video",
        }
    }

    /// Checks whether leading file bytes are plausible for this class.
    ///
    /// Covers the common container signatures only; an unrecognized prefix for
    /// `Image`/`Video` passes (the analyzers are the authority on content),
    /// while a PDF must start with its mandatory marker.
    pub fn matches_signature(&self, head: &[u8]) -> bool {
        match self {
            Self::Pdf => head.starts_with(b"%PDF-"),
            Self::Image => {
                head.starts_with(&[0xFF, 0xD8, 0xFF])          // JPEG
                    || head.starts_with(&[0x89, b'P', b'N', b'G'])
                    || head.starts_with(b"GIF8")
                    || head.starts_with(b"RIFF")               // WebP container
                    || head.starts_with(b"BM")
                    || !looks_like_text(head)
            }
            Self::Video => {
                (head.len() > 8 && &head[4..8] == b"ftyp")     // MP4/MOV
                    || head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) // Matroska/WebM
                    || head.starts_with(b"RIFF")
                    || !looks_like_text(head)
            }
        }
    }
}

fn looks_like_text(head: &[u8]) -> bool {
    !head.is_empty() && head.iter().take(64).all(|b| b.is_ascii())
}

impl std::fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 digest of an artifact's bytes, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, the form that appears in verdicts and logs.
    pub fn prefix(&self) -> &str {
        &self.0[..16]
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        for chunk in data.chunks(HASH_CHUNK_BYTES) {
            hasher.update(chunk);
        }
        Self(hex(&hasher.finalize()))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Generates a fresh correlation id for requests arriving without one.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generates the id for one processing attempt; the bus pairing key.
pub fn new_artifact_id() -> String {
    format!("art-{}", uuid::Uuid::new_v4().simple())
}

/// Where an artifact's bytes live.
#[derive(Clone, Debug)]
enum ArtifactSource {
    /// A file on disk. `owned` files are unlinked on cleanup.
    Path { path: PathBuf, owned: bool },
    /// An in-memory buffer, used by tests and embedded callers.
    Memory(Bytes),
}

/// One file handed to the dispatcher: opaque bytes plus declared class.
#[derive(Clone, Debug)]
pub struct FileArtifact {
    source: ArtifactSource,
    class: ArtifactClass,
    size_bytes: u64,
}

impl FileArtifact {
    /// Wraps an uploaded temp file. The dispatcher unlinks it when the
    /// request terminates, success or failure.
    pub fn from_temp_path(path: impl Into<PathBuf>, class: ArtifactClass, size_bytes: u64) -> Self {
        Self {
            source: ArtifactSource::Path { path: path.into(), owned: true },
            class,
            size_bytes,
        }
    }

    /// Wraps a caller-owned file that must survive the request.
    pub fn from_path(path: impl Into<PathBuf>, class: ArtifactClass, size_bytes: u64) -> Self {
        Self {
            source: ArtifactSource::Path { path: path.into(), owned: false },
            class,
            size_bytes,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>, class: ArtifactClass) -> Self {
        let data = data.into();
        let size_bytes = data.len() as u64;
        Self { source: ArtifactSource::Memory(data), class, size_bytes }
    }

    pub fn class(&self) -> ArtifactClass {
        self.class
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Path on disk, if the artifact is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ArtifactSource::Path { path, .. } => Some(path),
            ArtifactSource::Memory(_) => None,
        }
    }

    /// In-memory bytes, if the artifact is not file-backed. Cheap clone.
    pub fn bytes(&self) -> Option<Bytes> {
        match &self.source {
            ArtifactSource::Memory(data) => Some(data.clone()),
            ArtifactSource::Path { .. } => None,
        }
    }

    /// Leading bytes for signature validation, at most `n`.
    pub async fn head(&self, n: usize) -> Result<Vec<u8>> {
        match &self.source {
            ArtifactSource::Memory(data) => Ok(data[..data.len().min(n)].to_vec()),
            ArtifactSource::Path { path, .. } => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| DispatchError::Validation(format!("cannot open artifact: {e}")))?;
                let mut buf = vec![0u8; n];
                let mut read = 0;
                while read < n {
                    let k = file
                        .read(&mut buf[read..])
                        .await
                        .map_err(|e| DispatchError::Validation(format!("cannot read artifact: {e}")))?;
                    if k == 0 {
                        break;
                    }
                    read += k;
                }
                buf.truncate(read);
                Ok(buf)
            }
        }
    }

    /// Computes the SHA-256 content hash, reading file-backed artifacts in
    /// 64 KB chunks. Identical bytes always produce an identical hash.
    pub async fn content_hash(&self) -> Result<ContentHash> {
        match &self.source {
            ArtifactSource::Memory(data) => Ok(ContentHash::of_bytes(data)),
            ArtifactSource::Path { path, .. } => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| DispatchError::Validation(format!("cannot open artifact: {e}")))?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; HASH_CHUNK_BYTES];
                loop {
                    let n = file
                        .read(&mut buf)
                        .await
                        .map_err(|e| DispatchError::Validation(format!("cannot read artifact: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(ContentHash(hex(&hasher.finalize())))
            }
        }
    }

    /// Removes an owned temp file from disk. Idempotent; failures are logged
    /// and swallowed since the request outcome is already decided.
    pub async fn cleanup(&self) {
        if let ArtifactSource::Path { path, owned: true } = &self.source {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to unlink artifact");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_and_file_hashes_agree() {
        let data = vec![7u8; 200_000]; // spans multiple hash chunks
        let mem = FileArtifact::from_bytes(data.clone(), ArtifactClass::Image);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        tokio::fs::write(&path, &data).await.unwrap();
        let file = FileArtifact::from_path(&path, ArtifactClass::Image, data.len() as u64);

        assert_eq!(
            mem.content_hash().await.unwrap(),
            file.content_hash().await.unwrap()
        );
    }

    #[tokio::test]
    async fn identical_bytes_identical_hash() {
        let a = FileArtifact::from_bytes(&b"same bytes"[..], ArtifactClass::Pdf);
        let b = FileArtifact::from_bytes(&b"same bytes"[..], ArtifactClass::Pdf);
        let ha = a.content_hash().await.unwrap();
        let hb = b.content_hash().await.unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha.prefix().len(), 16);
    }

    #[tokio::test]
    async fn cleanup_unlinks_owned_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.jpg");
        tokio::fs::write(&path, b"\xFF\xD8\xFFdata").await.unwrap();

        let artifact = FileArtifact::from_temp_path(&path, ArtifactClass::Image, 7);
        artifact.cleanup().await;
        assert!(!path.exists());

        // second cleanup is a no-op
        artifact.cleanup().await;
    }

    #[test]
    fn pdf_signature_is_mandatory() {
        assert!(ArtifactClass::Pdf.matches_signature(b"%PDF-1.7 rest"));
        assert!(!ArtifactClass::Pdf.matches_signature(b"<html>"));
        assert!(ArtifactClass::Image.matches_signature(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(!ArtifactClass::Image.matches_signature(b"plain ascii text here"));
    }
}
