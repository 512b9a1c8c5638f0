//! Blob storage backends
//!
//! Bytes are addressed by slash-separated relative paths. The local
//! filesystem backend is the default; S3-compatible stores (MinIO, R2,
//! AWS) are supported through the AWS SDK.

mod local;
mod s3;
mod types;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;
pub use types::*;

use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};

/// Build the blob store selected by configuration
pub async fn create_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    match &config.backend {
        StorageBackend::Local { root } => Ok(Arc::new(LocalBlobStore::new(root.clone()).await?)),
        StorageBackend::S3 { .. } => Ok(Arc::new(S3BlobStore::new(&config.backend).await?)),
    }
}
