//! Bounded-memory streaming intake.

use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::sniff::{self, SNIFF_LEN};

/// Default read chunk.
pub const CHUNK_SIZE: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The running total crossed the cap mid-stream; nothing was kept.
    #[error("upload exceeds the {limit}-byte limit")]
    TooLarge { limit: u64 },

    /// The detected (or declared, when undetectable) type is not allowed.
    #[error("content type `{0}` not allowed")]
    TypeNotAllowed(String),

    #[error("upload stream failed: {0}")]
    Stream(String),

    #[error("temp storage failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Stored upload
// ---------------------------------------------------------------------------

/// A buffered upload on temp storage.
///
/// The file lives as long as this guard; dropping it (on any path, including
/// panics and early returns) removes the backing directory.
#[derive(Debug)]
pub struct StoredUpload {
    path: PathBuf,
    _dir: TempDir,
    pub size: u64,
    pub content_type: String,
    pub declared_type: Option<String>,
    pub filename: Option<String>,
}

impl StoredUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// UploadService
// ---------------------------------------------------------------------------

pub struct UploadService {
    max_size: u64,
    allowed_types: Vec<String>,
}

impl UploadService {
    pub fn new(max_size: u64, allowed_types: Vec<String>) -> Self {
        Self {
            max_size,
            allowed_types,
        }
    }

    /// Stream an upload into temp storage.
    ///
    /// The size cap is enforced per chunk, so an oversized body aborts long
    /// before it is fully read. After buffering, the head is sniffed; a
    /// declared type that disagrees with the detected one is logged and the
    /// detected type drives the allow-list decision.
    pub async fn buffer_stream<S, E>(
        &self,
        mut stream: S,
        declared_type: Option<&str>,
        filename: Option<&str>,
    ) -> Result<StoredUpload, UploadError>
    where
        S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
        E: std::fmt::Display,
    {
        let dir = TempDir::new()?;
        let path = dir.path().join("upload.part");
        let mut file = File::create(&path).await?;
        let mut total: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UploadError::Stream(e.to_string()))?;
            total += chunk.len() as u64;
            if total > self.max_size {
                // TempDir cleanup runs on drop; nothing survives this return.
                return Err(UploadError::TooLarge {
                    limit: self.max_size,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let detected = self.sniff_file(&path).await?;
        let content_type = match (&detected, declared_type) {
            (Some(detected), Some(declared)) if *detected != declared => {
                warn!(declared, detected, "declared content type contradicts magic bytes");
                detected.to_string()
            }
            (Some(detected), _) => detected.to_string(),
            (None, Some(declared)) => declared.to_string(),
            (None, None) => "application/octet-stream".to_string(),
        };

        if !self.allowed_types.iter().any(|t| t == &content_type) {
            return Err(UploadError::TypeNotAllowed(content_type));
        }

        debug!(size = total, content_type = %content_type, "upload buffered");
        Ok(StoredUpload {
            path,
            _dir: dir,
            size: total,
            content_type,
            declared_type: declared_type.map(str::to_string),
            filename: filename.map(str::to_string),
        })
    }

    async fn sniff_file(&self, path: &Path) -> Result<Option<&'static str>, UploadError> {
        let mut file = File::open(path).await?;
        let mut head = vec![0u8; SNIFF_LEN];
        let mut read = 0;
        while read < head.len() {
            let n = file.read(&mut head[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        head.truncate(read);
        Ok(sniff::detect(&head))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn service() -> UploadService {
        UploadService::new(
            1024,
            vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "video/mp4".to_string(),
            ],
        )
    }

    fn chunked(bytes: &[u8], chunk: usize) -> impl Stream<Item = Result<Vec<u8>, String>> + Unpin {
        let chunks: Vec<Result<Vec<u8>, String>> =
            bytes.chunks(chunk).map(|c| Ok(c.to_vec())).collect();
        stream::iter(chunks)
    }

    fn png_bytes(extra: usize) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\nIHDR".to_vec();
        bytes.extend(std::iter::repeat(0u8).take(extra));
        bytes
    }

    #[tokio::test]
    async fn upload_buffers_and_detects() {
        let svc = service();
        let body = png_bytes(100);

        let stored = svc
            .buffer_stream(chunked(&body, 16), Some("image/png"), Some("photo.png"))
            .await
            .unwrap();

        assert_eq!(stored.size, body.len() as u64);
        assert_eq!(stored.content_type, "image/png");
        assert!(stored.path().exists());

        let on_disk = std::fs::read(stored.path()).unwrap();
        assert_eq!(on_disk, body);
    }

    #[tokio::test]
    async fn oversized_upload_aborts_before_full_buffering() {
        let svc = service();
        // 4 KiB body against a 1 KiB cap, in 64-byte chunks: the abort must
        // come as soon as the cap is crossed, not at the end.
        let body = png_bytes(4096);
        let consumed = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = consumed.clone();

        let counted = stream::iter(
            body.chunks(64)
                .map(|c| c.to_vec())
                .collect::<Vec<_>>(),
        )
        .map(move |c| {
            counter.fetch_add(c.len(), std::sync::atomic::Ordering::SeqCst);
            Ok::<_, String>(c)
        });

        let err = svc
            .buffer_stream(Box::pin(counted), Some("image/png"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { limit: 1024 }));

        let seen = consumed.load(std::sync::atomic::Ordering::SeqCst);
        assert!(seen <= 1024 + 64, "consumed {seen} bytes past the cap");
    }

    #[tokio::test]
    async fn temp_file_never_survives_failure() {
        let svc = service();
        let body = png_bytes(4096);

        // Snoop the temp location by running a successful upload first.
        let stored = svc
            .buffer_stream(chunked(&png_bytes(10), 16), Some("image/png"), None)
            .await
            .unwrap();
        let parent = stored.path().parent().unwrap().to_path_buf();
        drop(stored);
        assert!(!parent.exists(), "temp dir should vanish with the guard");

        // The failure path cleans up the same way.
        let err = svc
            .buffer_stream(chunked(&body, 64), Some("image/png"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn detected_type_overrules_declared() {
        let svc = service();
        let jpeg = b"\xFF\xD8\xFF\xE0 jfif body".to_vec();

        let stored = svc
            .buffer_stream(chunked(&jpeg, 8), Some("image/png"), None)
            .await
            .unwrap();
        // Declared said png; magic bytes say jpeg; jpeg wins.
        assert_eq!(stored.content_type, "image/jpeg");
        assert_eq!(stored.declared_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn disallowed_type_rejected() {
        let svc = service();
        let gif = b"GIF89a....".to_vec();

        let err = svc
            .buffer_stream(chunked(&gif, 8), Some("image/gif"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TypeNotAllowed(t) if t == "image/gif"));
    }

    #[tokio::test]
    async fn undetectable_type_falls_back_to_declared() {
        let svc = service();
        let body = b"not a known signature".to_vec();

        // Declared jpeg is allowed and nothing contradicts it.
        let stored = svc
            .buffer_stream(chunked(&body, 8), Some("image/jpeg"), None)
            .await
            .unwrap();
        assert_eq!(stored.content_type, "image/jpeg");

        // No declared type at all: octet-stream, which is not allowed.
        let err = svc
            .buffer_stream(chunked(&body, 8), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TypeNotAllowed(_)));
    }
}
