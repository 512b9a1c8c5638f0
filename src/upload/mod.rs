//! Ingestion Module
//!
//! Accepts file bytes through two paths and stores each distinct
//! (content hash, type) pair once:
//! - Direct upload for small files, hashed while streaming to staging
//! - Chunked upload with resumable, order-independent chunk registration
//! - Server-side assembly of chunks in chunk-number order
//!
//! Chunked flow:
//! 1. Client registers chunk 1..=N, receiving an upload id on the first
//! 2. Client completes the upload once every chunk is registered
//! 3. Server deduplicates or assembles, then returns the file record
//! 4. Scratch chunks are purged in the background

pub mod assembler;
pub mod deduplication;
pub mod direct;
pub mod hashing;
pub mod layout;
pub mod records;
pub mod session;
pub mod types;

pub use assembler::Assembler;
pub use deduplication::{HashIndex, Stored};
pub use direct::DirectUploader;
pub use hashing::{compute_hash, HashingReader};
pub use records::RecordManager;
pub use session::{SessionManager, SweepStats};
pub use types::*;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::storage::BlobStore;

/// Stream `reader` into `path`, giving up as soon as `cancel` fires.
///
/// A cancelled write never commits; the backend discards its partial
/// output when the write future is dropped.
pub(crate) async fn write_or_cancel(
    store: &dyn BlobStore,
    path: &str,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    cancel: &CancellationToken,
) -> Result<u64> {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = store.write_stream(path, reader) => Some(result),
    };

    match outcome {
        Some(result) => Ok(result?),
        None => {
            tracing::debug!(path = %path, "Write cancelled");
            Err(IngestError::Cancelled)
        }
    }
}

/// Best-effort removal of a blob the caller no longer references
pub(crate) async fn discard(store: &dyn BlobStore, path: &str) {
    if let Err(e) = store.remove(path).await {
        tracing::warn!(path = %path, error = %e, "Failed to remove unreferenced blob");
    }
}
