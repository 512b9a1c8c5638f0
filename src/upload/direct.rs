//! Direct upload path for files small enough to send in one request

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::db::{FileRecord, NewFileRecord};
use crate::error::{IngestError, Result, ValidationError};
use crate::state::IngestContext;

use super::deduplication::{HashIndex, Stored};
use super::hashing::HashingReader;
use super::types::{validate_file_name, validate_file_type, DirectUpload};
use super::{discard, layout, write_or_cancel};

/// Single-request uploads
#[derive(Clone)]
pub struct DirectUploader {
    ctx: IngestContext,
    index: HashIndex,
}

impl DirectUploader {
    pub fn new(ctx: IngestContext) -> Self {
        let index = HashIndex::new(ctx.db().clone());
        Self { ctx, index }
    }

    /// Store `source` unless identical content of the same type already
    /// exists, returning the record the bytes resolve to.
    ///
    /// The source is read exactly once. A record is only created after its
    /// bytes are fully written; every failure removes what was written.
    pub async fn upload<R>(
        &self,
        request: &DirectUpload,
        source: R,
        cancel: &CancellationToken,
    ) -> Result<FileRecord>
    where
        R: AsyncRead + Send + Unpin,
    {
        let max = self.ctx.config().ingest.direct_upload_max_bytes;
        if request.declared_size > max {
            return Err(IngestError::SizeExceeded {
                size: request.declared_size,
                max,
            });
        }
        validate_file_type(&request.file_type)?;
        validate_file_name(&request.file_name)?;

        let store = self.ctx.store().as_ref();
        let staging = layout::staging_path();

        // One byte past the limit is enough to tell an oversized source
        let mut reader = HashingReader::new(source.take(max.saturating_add(1)));
        if let Err(e) = write_or_cancel(store, &staging, &mut reader, cancel).await {
            discard(store, &staging).await;
            return Err(e);
        }

        let (content_hash, size) = reader.finish();
        if size > max {
            discard(store, &staging).await;
            return Err(IngestError::SizeExceeded { size, max });
        }
        if size != request.declared_size {
            discard(store, &staging).await;
            return Err(ValidationError::FileSizeMismatch {
                declared: request.declared_size,
                actual: size,
            }
            .into());
        }

        let existing = match self.index.find_any(&content_hash, &request.file_type).await {
            Ok(existing) => existing,
            Err(e) => {
                discard(store, &staging).await;
                return Err(e);
            }
        };

        if let Some(existing) = existing {
            discard(store, &staging).await;
            return self.index.reuse(existing).await;
        }

        let extension = layout::extension_of(&request.file_name);
        let relative_path = layout::blob_path(&request.file_type, &content_hash, &extension);
        if let Err(e) = store.rename(&staging, &relative_path).await {
            discard(store, &staging).await;
            return Err(e.into());
        }

        let new_record = NewFileRecord {
            name: request.file_name.clone(),
            content_type: request.file_type.clone(),
            extension,
            absolute_url: layout::absolute_url(&self.ctx.config().storage.base_url, &relative_path),
            relative_path,
            content_hash,
            size,
        };

        match self.index.insert_or_fetch(&new_record).await {
            Ok(Stored::Created(record)) => Ok(record),
            Ok(Stored::Existing(record)) => {
                discard(store, &new_record.relative_path).await;
                Ok(record)
            }
            Err(e) => {
                discard(store, &new_record.relative_path).await;
                Err(e)
            }
        }
    }
}
