//! Post-transfer integrity check.
//!
//! [`verify`] decides whether the received file is byte-identical to the
//! source: existence first, then an emptiness pre-check from metadata, then
//! streamed SHA-256 digests. Each failure has its own [`IntegrityError`]
//! variant.

pub mod hasher;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("size mismatch: source has {original} bytes, received {received}")]
    SizeMismatch { original: u64, received: u64 },

    #[error("content mismatch: source {original}, received {received}")]
    ContentMismatch { original: String, received: String },

    #[error("I/O error while verifying: {0}")]
    Io(#[from] std::io::Error),
}

/// Successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Hex SHA-256 shared by both files.
    pub digest: String,
    pub size: u64,
}

/// Transfer rate over a measured interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub bytes_per_sec: f64,
}

impl Throughput {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let bytes_per_sec = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        Self {
            bytes,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            bytes_per_sec,
        }
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {}ms ({:.0} bytes/s)",
            self.bytes, self.elapsed_ms, self.bytes_per_sec
        )
    }
}

/// Regular-file size, or [`IntegrityError::MissingFile`].
async fn file_size(path: &Path) -> Result<u64, IntegrityError> {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => Ok(m.len()),
        Ok(_) => Err(IntegrityError::MissingFile(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(IntegrityError::MissingFile(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Check that `received` holds exactly the bytes of `source`.
pub async fn verify(source: &Path, received: &Path) -> Result<Verdict, IntegrityError> {
    let source_size = file_size(source).await?;
    let received_size = file_size(received).await?;

    // Cheap rejection before hashing anything.
    if (source_size == 0) != (received_size == 0) {
        return Err(IntegrityError::SizeMismatch {
            original: source_size,
            received: received_size,
        });
    }

    let source_digest = hasher::hash_file(source).await?;
    let received_digest = hasher::hash_file(received).await?;
    if source_digest != received_digest {
        return Err(IntegrityError::ContentMismatch {
            original: source_digest,
            received: received_digest,
        });
    }

    Ok(Verdict {
        digest: source_digest,
        size: source_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_identical_files_verify() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", b"a\nbb\nccc\n");
        let b = write(dir.path(), "b", b"a\nbb\nccc\n");
        let verdict = verify(&a, &b).await.unwrap();
        assert_eq!(verdict.size, 9);
        assert_eq!(verdict.digest, hasher::hash_bytes(b"a\nbb\nccc\n"));
    }

    #[tokio::test]
    async fn test_two_empty_files_verify() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", b"");
        let b = write(dir.path(), "b", b"");
        assert_eq!(verify(&a, &b).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", b"x");
        let missing = dir.path().join("nope");
        assert!(matches!(
            verify(&a, &missing).await,
            Err(IntegrityError::MissingFile(p)) if p == missing
        ));
        assert!(matches!(
            verify(&missing, &a).await,
            Err(IntegrityError::MissingFile(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", b"x");
        assert!(matches!(
            verify(&a, dir.path()).await,
            Err(IntegrityError::MissingFile(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_received_is_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", &[b'z'; 100]);
        let b = write(dir.path(), "b", b"");
        assert!(matches!(
            verify(&a, &b).await,
            Err(IntegrityError::SizeMismatch {
                original: 100,
                received: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_different_content_is_content_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", b"a\nbb\nccc\n");
        let b = write(dir.path(), "b", b"a\nbb\n");
        match verify(&a, &b).await {
            Err(IntegrityError::ContentMismatch { original, received }) => {
                assert_eq!(original, hasher::hash_bytes(b"a\nbb\nccc\n"));
                assert_eq!(received, hasher::hash_bytes(b"a\nbb\n"));
            }
            other => panic!("expected content mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_throughput() {
        let t = Throughput::new(1000, Duration::from_millis(500));
        assert_eq!(t.elapsed_ms, 500);
        assert!((t.bytes_per_sec - 2000.0).abs() < f64::EPSILON);
        assert_eq!(t.to_string(), "1000 bytes in 500ms (2000 bytes/s)");
    }

    #[test]
    fn test_throughput_zero_elapsed() {
        assert!(Throughput::new(42, Duration::ZERO).bytes_per_sec.abs() < f64::EPSILON);
    }
}
