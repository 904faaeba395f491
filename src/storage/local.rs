//! Local filesystem storage backend.
//!
//! For object id `X` two sibling files live directly under the root:
//! `X` holds the content and `X.meta` holds the [`FileMetadata`] as JSON.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.
//! Content is written before its sidecar, so a visible sidecar always
//! implies complete content.
//!
//! Filesystem calls are blocking, so every operation runs on the blocking
//! thread pool via `tokio::task::spawn_blocking`.

use bytes::Bytes;
use std::ffi::OsString;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::backend::{
    check_id, FileMetadata, FileStore, StorageError, StoreFuture, StoredFile,
};

/// Suffix of the metadata sidecar.
const META_SUFFIX: &str = ".meta";

/// Scratch directory for in-flight writes.
const TMP_DIR: &str = ".tmp";

/// Stores files on the local filesystem.
#[derive(Clone)]
pub struct LocalFileStore {
    /// Absolute, lexically normalized root directory.
    root: Arc<Path>,
}

impl LocalFileStore {
    /// Create a new `LocalFileStore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        let root = normalize_lexically(&root);
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self {
            root: Arc::from(root),
        })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an id to its content path.
    ///
    /// The id must be a single plain path segment, so every stored file has
    /// exactly one name.  The joined path is then normalized without touching
    /// the filesystem and must name a direct child of the root.
    fn resolve(&self, id: &str) -> Result<PathBuf, StorageError> {
        if let Err(e) = check_id(id) {
            tracing::warn!("Path traversal rejected for id {:?}", id);
            return Err(e);
        }

        let violation = || StorageError::PathViolation { id: id.to_string() };
        let path = normalize_lexically(&self.root.join(id));
        if path.parent() != Some(&*self.root) || path == *self.root {
            tracing::warn!("Path traversal rejected for id {:?}", id);
            return Err(violation());
        }
        if path.file_name().is_some_and(|name| name == TMP_DIR) {
            return Err(violation());
        }
        Ok(path)
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{}", id))
    }

    /// Crash-only: temp-fsync-rename.
    fn write_atomic(&self, final_path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp_path = self.temp_path();
        let result = (|| {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, final_path)
        })();

        result.map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            StorageError::io(format!("failed to write {}", final_path.display()), e)
        })
    }

    fn read_metadata(&self, id: &str, content_path: &Path) -> Result<FileMetadata, StorageError> {
        let meta_path = sidecar_path(content_path);
        let raw = std::fs::read(&meta_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound { id: id.to_string() },
            _ => StorageError::io(format!("failed to read {}", meta_path.display()), e),
        })?;
        serde_json::from_slice(&raw).map_err(|source| StorageError::CorruptMetadata {
            id: id.to_string(),
            source,
        })
    }

    fn store_blocking(
        &self,
        id: &str,
        data: &[u8],
        metadata: &FileMetadata,
    ) -> Result<(), StorageError> {
        let content_path = self.resolve(id)?;
        let meta_path = sidecar_path(&content_path);

        let encoded =
            serde_json::to_vec_pretty(metadata).map_err(|source| StorageError::CorruptMetadata {
                id: id.to_string(),
                source,
            })?;

        self.write_atomic(&content_path, data)?;

        if let Err(e) = self.write_atomic(&meta_path, &encoded) {
            // Best-effort: do not leave content without a sidecar.
            let _ = std::fs::remove_file(&content_path);
            return Err(e);
        }

        tracing::debug!("Stored {} ({} bytes) at {}", id, data.len(), content_path.display());
        Ok(())
    }

    fn retrieve_blocking(&self, id: &str) -> Result<StoredFile, StorageError> {
        let content_path = self.resolve(id)?;
        let metadata = self.read_metadata(id, &content_path)?;

        let file = std::fs::File::open(&content_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound { id: id.to_string() },
            _ => StorageError::io(format!("failed to open {}", content_path.display()), e),
        })?;

        Ok(StoredFile {
            content: Box::new(file),
            metadata,
        })
    }

    fn delete_blocking(&self, id: &str) -> Result<(), StorageError> {
        let content_path = self.resolve(id)?;
        // Sidecar first so a half-finished delete never leaves a
        // sidecar pointing at missing content.
        remove_if_present(&sidecar_path(&content_path))?;
        remove_if_present(&content_path)
    }

    fn probe_blocking(&self) -> Result<(), StorageError> {
        if !self.root.is_dir() {
            return Err(StorageError::io(
                format!("storage root {} is not a directory", self.root.display()),
                std::io::Error::from(ErrorKind::NotFound),
            ));
        }
        let probe = self.temp_path();
        std::fs::write(&probe, b"probe")
            .map_err(|e| StorageError::io("storage root is not writable", e))?;
        remove_if_present(&probe)
    }
}

/// Run a blocking filesystem closure on tokio's blocking pool.
async fn run_blocking<T, F>(op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op).await.map_err(|e| {
        StorageError::io("blocking storage task failed", std::io::Error::other(e))
    })?
}

/// `X` -> `X.meta`.
fn sidecar_path(content_path: &Path) -> PathBuf {
    let mut name: OsString = content_path.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

/// Resolve `.` and `..` components without consulting the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Remove `path`, treating absence as success.
fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(format!("failed to delete {}", path.display()), e)),
    }
}

impl FileStore for LocalFileStore {
    fn store(
        &self,
        id: &str,
        data: Bytes,
        metadata: &FileMetadata,
    ) -> StoreFuture<'_, Result<(), StorageError>> {
        let this = self.clone();
        let id = id.to_string();
        let metadata = metadata.clone();
        Box::pin(run_blocking(move || this.store_blocking(&id, &data, &metadata)))
    }

    fn retrieve(&self, id: &str) -> StoreFuture<'_, Result<StoredFile, StorageError>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(run_blocking(move || this.retrieve_blocking(&id)))
    }

    fn exists(&self, id: &str) -> StoreFuture<'_, bool> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            run_blocking(move || Ok(this.resolve(&id).is_ok_and(|path| path.is_file())))
                .await
                .unwrap_or(false)
        })
    }

    fn get_metadata(&self, id: &str) -> StoreFuture<'_, Result<FileMetadata, StorageError>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(run_blocking(move || {
            let content_path = this.resolve(&id)?;
            this.read_metadata(&id, &content_path)
        }))
    }

    fn delete(&self, id: &str) -> StoreFuture<'_, Result<(), StorageError>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(run_blocking(move || this.delete_blocking(&id)))
    }

    fn probe(&self) -> StoreFuture<'_, Result<(), StorageError>> {
        let this = self.clone();
        Box::pin(run_blocking(move || this.probe_blocking()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
