//! In-memory storage backend.
//!
//! Content and metadata for an id live in one map entry behind a
//! `tokio::sync::RwLock`, so both artifacts appear and disappear together.
//! Nothing survives a restart; intended for tests and ephemeral deployments.

use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;

use super::backend::{check_id, FileMetadata, FileStore, StorageError, StoreFuture, StoredFile};

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryFileStore {
    /// id -> (content, metadata).
    files: tokio::sync::RwLock<HashMap<String, (Bytes, FileMetadata)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files.
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

impl FileStore for MemoryFileStore {
    fn store(
        &self,
        id: &str,
        data: Bytes,
        metadata: &FileMetadata,
    ) -> StoreFuture<'_, Result<(), StorageError>> {
        let id = id.to_string();
        let metadata = metadata.clone();
        Box::pin(async move {
            check_id(&id)?;
            self.files.write().await.insert(id, (data, metadata));
            Ok(())
        })
    }

    fn retrieve(&self, id: &str) -> StoreFuture<'_, Result<StoredFile, StorageError>> {
        let id = id.to_string();
        Box::pin(async move {
            check_id(&id)?;
            let files = self.files.read().await;
            let (data, metadata) = files
                .get(&id)
                .ok_or_else(|| StorageError::NotFound { id: id.clone() })?;
            Ok(StoredFile {
                // `Bytes` clones share the buffer.
                content: Box::new(Cursor::new(data.clone())),
                metadata: metadata.clone(),
            })
        })
    }

    fn exists(&self, id: &str) -> StoreFuture<'_, bool> {
        let id = id.to_string();
        Box::pin(async move {
            if check_id(&id).is_err() {
                return false;
            }
            self.files.read().await.contains_key(&id)
        })
    }

    fn get_metadata(&self, id: &str) -> StoreFuture<'_, Result<FileMetadata, StorageError>> {
        let id = id.to_string();
        Box::pin(async move {
            check_id(&id)?;
            self.files
                .read()
                .await
                .get(&id)
                .map(|(_, metadata)| metadata.clone())
                .ok_or(StorageError::NotFound { id })
        })
    }

    fn delete(&self, id: &str) -> StoreFuture<'_, Result<(), StorageError>> {
        let id = id.to_string();
        Box::pin(async move {
            check_id(&id)?;
            self.files.write().await.remove(&id);
            Ok(())
        })
    }

    fn probe(&self) -> StoreFuture<'_, Result<(), StorageError>> {
        Box::pin(async { Ok(()) })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Read;

    fn metadata(id: &str) -> FileMetadata {
        FileMetadata {
            id: id.to_string(),
            original_name: "doc.pdf".to_string(),
            size: 5,
            content_type: "application/pdf".to_string(),
            upload_time: Utc::now(),
            checksum: "cd".repeat(32),
            owner_id: "u2".to_string(),
            url: format!("/api/v1/files/{id}"),
        }
    }

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        let store = MemoryFileStore::new();
        assert!(store.is_empty().await);

        store
            .store("m1", Bytes::from_static(b"%PDF-"), &metadata("m1"))
            .await
            .unwrap();
        assert!(store.exists("m1").await);
        assert_eq!(store.len().await, 1);

        let mut stored = store.retrieve("m1").await.unwrap();
        let mut buf = Vec::new();
        stored.content.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"%PDF-");
        assert_eq!(stored.metadata.owner_id, "u2");

        store.delete("m1").await.unwrap();
        assert!(!store.exists("m1").await);
        store.delete("m1").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let store = MemoryFileStore::new();
        assert!(store.get_metadata("x").await.unwrap_err().is_not_found());
        assert!(store.retrieve("x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_path_like_ids_rejected() {
        let store = MemoryFileStore::new();
        assert!(!store.exists("../etc/passwd").await);
        assert!(matches!(
            store.store("../x", Bytes::new(), &metadata("../x")).await,
            Err(StorageError::PathViolation { .. })
        ));
        assert!(store.is_empty().await);
    }
}
