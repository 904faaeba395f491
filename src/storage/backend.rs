//! Abstract file store trait.
//!
//! Every storage backend must implement [`FileStore`].  Objects are addressed
//! only by a server-generated id; each id owns a content artifact and a
//! metadata artifact that are written, read, and deleted together.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`FileStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Attributes of one stored file.  Written once at upload, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Server-generated unique id; the sole addressing key.
    pub id: String,
    /// Sanitized client filename, for display only.
    pub original_name: String,
    /// Exact number of stored content bytes.
    pub size: u64,
    /// Validated content type.
    pub content_type: String,
    /// When the file was persisted (UTC).
    pub upload_time: DateTime<Utc>,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub checksum: String,
    /// Subject that uploaded the file.
    #[serde(alias = "user_id")]
    pub owner_id: String,
    /// Id-addressed download path.
    pub url: String,
}

/// Stored content plus its metadata.  Dropping `content` releases the
/// underlying handle.
pub struct StoredFile {
    /// Reader over exactly the bytes that were stored.
    pub content: Box<dyn Read + Send>,
    /// The metadata sidecar.
    pub metadata: FileMetadata,
}

impl std::fmt::Debug for StoredFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredFile")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Storage failures.  These carry internal detail for logs only.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The id would resolve outside the storage root.
    #[error("path violation for id {id:?}")]
    PathViolation { id: String },

    /// No metadata (or content) exists for the id.
    #[error("no stored file with id {id}")]
    NotFound { id: String },

    /// The metadata sidecar exists but cannot be decoded.
    #[error("corrupt metadata for id {id}: {source}")]
    CorruptMetadata {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Underlying I/O failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }

    /// `true` for [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Reject ids that could be read as a path rather than a single name.
pub fn check_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\', '\0']) {
        return Err(StorageError::PathViolation { id: id.to_string() });
    }
    Ok(())
}

/// Object storage contract.
///
/// The filesystem variant is [`super::local::LocalFileStore`]; the in-memory
/// variant is [`super::memory::MemoryFileStore`].
pub trait FileStore: Send + Sync + 'static {
    /// Persist `data` and `metadata` under `id`.
    fn store(
        &self,
        id: &str,
        data: Bytes,
        metadata: &FileMetadata,
    ) -> StoreFuture<'_, Result<(), StorageError>>;

    /// Open the content for `id`.  Metadata is loaded first; its absence is
    /// [`StorageError::NotFound`].
    fn retrieve(&self, id: &str) -> StoreFuture<'_, Result<StoredFile, StorageError>>;

    /// `true` iff `id` resolves inside the store and its content is present.
    fn exists(&self, id: &str) -> StoreFuture<'_, bool>;

    /// Load only the metadata for `id`.
    fn get_metadata(&self, id: &str) -> StoreFuture<'_, Result<FileMetadata, StorageError>>;

    /// Remove both artifacts for `id`.  Missing artifacts are not an error.
    fn delete(&self, id: &str) -> StoreFuture<'_, Result<(), StorageError>>;

    /// Check that the store can currently accept writes.
    fn probe(&self) -> StoreFuture<'_, Result<(), StorageError>>;
}
