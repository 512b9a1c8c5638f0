//! Blob store trait and shared types

use std::path::PathBuf;
use std::pin::Pin;

use tokio::io::AsyncRead;

/// Readable handle over a stored blob
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Blob I/O errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 SDK error: {0}")]
    SdkError(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

/// Path-addressable byte storage
///
/// Writes are all-or-nothing from a reader's point of view: a blob is either
/// absent or holds the complete bytes of one write.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `reader` to `path` until EOF, replacing any existing blob.
    /// Returns the number of bytes written.
    async fn write_stream(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StorageError>;

    /// Write an in-memory buffer to `path`
    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut reader = data;
        self.write_stream(path, &mut reader).await?;
        Ok(())
    }

    /// Open a blob for reading
    async fn open_read(&self, path: &str) -> Result<BlobReader, StorageError>;

    /// Move a blob to a new path, replacing any blob already there
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Remove a single blob. Missing blobs are not an error.
    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Remove every blob under `prefix`, returning how many were removed
    async fn remove_tree(&self, prefix: &str) -> Result<usize, StorageError>;

    /// Filesystem location of a blob, for backends that have one
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}
