//! Upload and download pipelines.
//!
//! [`IngestionService`] owns the [`Validator`] and the [`FileStore`] and is
//! the only component that talks to both.  Every step is a hard gate: a
//! failure returns immediately and nothing becomes visible in storage.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{Read, Seek};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::ApiError;
use crate::metrics::{BYTES_RECEIVED_TOTAL, DOWNLOADS_TOTAL, UPLOADS_TOTAL};
use crate::storage::backend::{FileMetadata, FileStore, StorageError, StoredFile};
use crate::validation::{sanitize_file_name, ValidationError, Validator};

/// Path prefix of the id-addressed download route.
pub const FILES_PATH: &str = "/api/v1/files";

/// Successful upload result.  Never contains the storage location.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: String,
    pub url: String,
    pub size: u64,
    pub content_type: String,
    pub upload_time: DateTime<Utc>,
    pub checksum: String,
}

impl From<FileMetadata> for UploadResponse {
    fn from(meta: FileMetadata) -> Self {
        Self {
            id: meta.id,
            url: meta.url,
            size: meta.size,
            content_type: meta.content_type,
            upload_time: meta.upload_time,
            checksum: meta.checksum,
        }
    }
}

/// One file as declared by the client, plus its readable content.
pub struct Upload<R> {
    pub file_name: String,
    pub declared_size: u64,
    pub declared_content_type: String,
    pub content: R,
}

/// Hex-encoded SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Orchestrates validation, hashing, and persistence.
pub struct IngestionService {
    validator: Validator,
    store: Arc<dyn FileStore>,
}

impl IngestionService {
    pub fn new(validator: Validator, store: Arc<dyn FileStore>) -> Self {
        Self { validator, store }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Run the upload pipeline for `subject`.
    pub async fn upload<R>(
        &self,
        subject: Option<&str>,
        upload: Upload<R>,
    ) -> Result<UploadResponse, ApiError>
    where
        R: Read + Seek + Send,
    {
        let result = self.upload_inner(subject, upload).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(ApiError::Internal(_)) => "error",
            Err(_) => "rejected",
        };
        counter!(UPLOADS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn upload_inner<R>(
        &self,
        subject: Option<&str>,
        upload: Upload<R>,
    ) -> Result<UploadResponse, ApiError>
    where
        R: Read + Seek + Send,
    {
        let owner = subject
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::Unauthenticated)?;

        let Upload {
            file_name,
            declared_size,
            declared_content_type,
            mut content,
        } = upload;

        let content_type = self
            .validator
            .validate_declaration(&file_name, declared_size, &declared_content_type)
            .map_err(|e| rejected(owner, &file_name, e))?;

        self.validator
            .validate_content(&mut content, &content_type)
            .map_err(|e| rejected(owner, &file_name, e))?;

        let data = self.read_bounded(&mut content).map_err(|e| rejected(owner, &file_name, e))?;
        drop(content);

        let digest = checksum(&data);
        let id = uuid::Uuid::new_v4().to_string();
        let metadata = FileMetadata {
            id: id.clone(),
            original_name: sanitize_file_name(&file_name),
            size: data.len() as u64,
            content_type,
            upload_time: Utc::now(),
            checksum: digest,
            owner_id: owner.to_string(),
            url: format!("{FILES_PATH}/{id}"),
        };

        self.store
            .store(&id, data, &metadata)
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("failed to store upload")))?;

        counter!(BYTES_RECEIVED_TOTAL).increment(metadata.size);
        info!(
            "Stored file {} for {} ({} bytes, {}, sha256 {})",
            metadata.id, owner, metadata.size, metadata.content_type, metadata.checksum
        );
        Ok(metadata.into())
    }

    /// Read the whole stream, refusing anything over the ceiling.
    fn read_bounded<R: Read>(&self, content: &mut R) -> Result<Bytes, ValidationError> {
        let max = self.validator.max_file_size();
        let mut buf = Vec::new();
        content.take(max.saturating_add(1)).read_to_end(&mut buf)?;
        let size = buf.len() as u64;
        if size > max {
            return Err(ValidationError::FileTooLarge { size, max });
        }
        Ok(Bytes::from(buf))
    }

    /// Run the download pipeline, opening the content for `subject`.
    pub async fn download(&self, subject: Option<&str>, id: &str) -> Result<StoredFile, ApiError> {
        let (owner, _) = self.authorize(subject, id).await?;

        let stored = self.store.retrieve(id).await.map_err(|e| storage_failure(id, e))?;
        counter!(DOWNLOADS_TOTAL, "kind" => "content").increment(1);
        info!("Serving file {} to {} ({} bytes)", id, owner, stored.metadata.size);
        Ok(stored)
    }

    /// Download pipeline variant that returns only the metadata and never
    /// opens the content.
    pub async fn metadata(&self, subject: Option<&str>, id: &str) -> Result<FileMetadata, ApiError> {
        let (_, metadata) = self.authorize(subject, id).await?;
        counter!(DOWNLOADS_TOTAL, "kind" => "metadata").increment(1);
        Ok(metadata)
    }

    /// Steps shared by both download variants.  Unknown ids, unreadable
    /// metadata, and foreign ownership all produce the same `NotFound`.
    async fn authorize<'a>(
        &self,
        subject: Option<&'a str>,
        id: &str,
    ) -> Result<(&'a str, FileMetadata), ApiError> {
        let caller = subject
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::Unauthenticated)?;

        if id.trim().is_empty() {
            return Err(ApiError::invalid_request("File ID is required"));
        }

        if !self.store.exists(id).await {
            debug!("File {} not found", id);
            return Err(ApiError::NotFound);
        }

        let metadata = match self.store.get_metadata(id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Metadata unavailable for {}: {}", id, e);
                return Err(ApiError::NotFound);
            }
        };

        if metadata.owner_id != caller {
            warn!("Subject {} requested file {} owned by another subject", caller, id);
            return Err(ApiError::NotFound);
        }

        Ok((caller, metadata))
    }
}

fn rejected(owner: &str, file_name: &str, err: ValidationError) -> ApiError {
    warn!("Upload of {:?} by {} rejected: {}", file_name, owner, err);
    err.into()
}

fn storage_failure(id: &str, err: StorageError) -> ApiError {
    match err {
        StorageError::NotFound { .. } | StorageError::PathViolation { .. } => ApiError::NotFound,
        other => ApiError::Internal(anyhow::Error::new(other).context(format!("failed to open file {id}"))),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryFileStore;
    use std::io::{Cursor, SeekFrom};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PNG_10: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00";
    const PDF: &[u8] = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n";

    fn service(max: u64) -> (IngestionService, Arc<MemoryFileStore>) {
        let store = Arc::new(MemoryFileStore::new());
        let allowed = vec![
            "image/png".to_string(),
            "image/jpeg".to_string(),
            "image/jpg".to_string(),
            "application/pdf".to_string(),
        ];
        let svc = IngestionService::new(Validator::new(max, &allowed), store.clone());
        (svc, store)
    }

    fn upload(name: &str, ct: &str, data: &[u8]) -> Upload<Cursor<Vec<u8>>> {
        Upload {
            file_name: name.to_string(),
            declared_size: data.len() as u64,
            declared_content_type: ct.to_string(),
            content: Cursor::new(data.to_vec()),
        }
    }

    /// Reader that counts how many times `read` was called.
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(buf)
        }
    }

    impl Seek for CountingReader {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[tokio::test]
    async fn test_upload_then_download_roundtrip() {
        let (svc, _store) = service(1024);
        let resp = svc.upload(Some("u1"), upload("a.png", "image/png", PNG_10)).await.unwrap();

        assert_eq!(resp.size, 10);
        assert_eq!(resp.content_type, "image/png");
        assert_eq!(resp.checksum, checksum(PNG_10));
        assert_eq!(resp.checksum.len(), 64);
        assert_eq!(resp.url, format!("/api/v1/files/{}", resp.id));

        let mut stored = svc.download(Some("u1"), &resp.id).await.unwrap();
        let mut data = Vec::new();
        stored.content.read_to_end(&mut data).unwrap();
        assert_eq!(data, PNG_10);
        assert_eq!(checksum(&data), resp.checksum);
        assert_eq!(stored.metadata.original_name, "a.png");
        assert_eq!(stored.metadata.owner_id, "u1");
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (svc, store) = service(1024);
        let a = svc.upload(Some("u1"), upload("a.png", "image/png", PNG_10)).await.unwrap();
        let b = svc.upload(Some("u1"), upload("a.png", "image/png", PNG_10)).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_upload_requires_subject() {
        let (svc, store) = service(1024);
        let err = svc.upload(None, upload("a.png", "image/png", PNG_10)).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated));
        let err = svc.upload(Some(""), upload("a.png", "image/png", PNG_10)).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_pdf_declared_as_png_rejected() {
        let (svc, store) = service(1024);
        let err = svc.upload(Some("u1"), upload("a.png", "image/png", PDF)).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidType));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_jpg_alias_accepted() {
        let (svc, _store) = service(1024);
        let jpeg = b"\xff\xd8\xff\xe0\x00\x10JFIF\x00";
        let resp = svc.upload(Some("u1"), upload("p.jpg", "image/jpg", jpeg)).await.unwrap();
        assert_eq!(resp.content_type, "image/jpg");
        let resp = svc.upload(Some("u1"), upload("p.jpeg", "image/jpeg", jpeg)).await.unwrap();
        assert_eq!(resp.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_content_type_inferred_from_extension() {
        let (svc, _store) = service(1024);
        let resp = svc.upload(Some("u1"), upload("doc.pdf", "", PDF)).await.unwrap();
        assert_eq!(resp.content_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_oversized_declaration_rejected_before_read() {
        let (svc, store) = service(8);
        let reads = Arc::new(AtomicUsize::new(0));
        let content = CountingReader {
            inner: Cursor::new(PNG_10.to_vec()),
            reads: reads.clone(),
        };
        let req = Upload {
            file_name: "a.png".to_string(),
            declared_size: 10,
            declared_content_type: "image/png".to_string(),
            content,
        };

        let err = svc.upload(Some("u1"), req).await.unwrap_err();
        assert!(matches!(err, ApiError::FileTooLarge));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_understated_declaration_still_bounded() {
        let (svc, store) = service(8);
        let mut req = upload("a.png", "image/png", PNG_10);
        req.declared_size = 4;
        let err = svc.upload(Some("u1"), req).await.unwrap_err();
        assert!(matches!(err, ApiError::FileTooLarge));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let (svc, _store) = service(1024);
        let err = svc.upload(Some("u1"), upload("a.png", "image/png", b"")).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_original_name_sanitized() {
        let (svc, _store) = service(1024);
        let resp = svc
            .upload(Some("u1"), upload("../../etc/evil.png", "image/png", PNG_10))
            .await
            .unwrap();
        let meta = svc.metadata(Some("u1"), &resp.id).await.unwrap();
        assert_eq!(meta.original_name, "evil.png");
        assert_ne!(meta.id, meta.original_name);
    }

    #[tokio::test]
    async fn test_foreign_owner_looks_like_missing() {
        let (svc, _store) = service(1024);
        let resp = svc.upload(Some("alice"), upload("a.png", "image/png", PNG_10)).await.unwrap();

        let foreign = svc.download(Some("bob"), &resp.id).await.unwrap_err();
        let missing = svc.download(Some("bob"), "no-such-id").await.unwrap_err();
        assert!(matches!(foreign, ApiError::NotFound));
        assert!(matches!(missing, ApiError::NotFound));
        assert_eq!(foreign.body().message, missing.body().message);

        assert!(matches!(
            svc.metadata(Some("bob"), &resp.id).await.unwrap_err(),
            ApiError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_download_requires_subject_and_id() {
        let (svc, _store) = service(1024);
        assert!(matches!(
            svc.download(None, "x").await.unwrap_err(),
            ApiError::Unauthenticated
        ));
        assert!(matches!(
            svc.download(Some("u1"), "").await.unwrap_err(),
            ApiError::InvalidRequest { .. }
        ));
    }

    #[tokio::test]
    async fn test_traversal_id_is_not_found() {
        let (svc, _store) = service(1024);
        let err = svc.download(Some("u1"), "../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::storage::local::LocalFileStore::new(dir.path()).unwrap());
        let svc = IngestionService::new(
            Validator::new(1024, &["image/png".to_string()]),
            store,
        );
        std::fs::write(dir.path().join("abc"), PNG_10).unwrap();
        std::fs::write(dir.path().join("abc.meta"), b"garbage").unwrap();

        let err = svc.download(Some("u1"), "abc").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[test]
    fn test_checksum_known_value() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
