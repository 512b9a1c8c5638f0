//! Chunk assembly
//!
//! Concatenates a session's chunks in chunk-number order into one blob,
//! hashing on the way, and finalizes the file record.

use std::io;

use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use crate::db::{ChunkSession, FileRecord, NewFileRecord, SessionRepository};
use crate::error::{IngestError, IntegrityError, Result};
use crate::state::IngestContext;

use super::deduplication::{HashIndex, Stored};
use super::hashing::HashingReader;
use super::{discard, layout, write_or_cancel};

/// Merges chunk sessions into stored files
#[derive(Clone)]
pub struct Assembler {
    ctx: IngestContext,
    index: HashIndex,
}

impl Assembler {
    pub fn new(ctx: IngestContext) -> Self {
        let index = HashIndex::new(ctx.db().clone());
        Self { ctx, index }
    }

    /// Merge a claimed session into a new file record.
    ///
    /// Chunks are streamed one after another, so memory use does not grow
    /// with file size. The destination blob is removed on every failure.
    pub async fn merge(&self, session: &ChunkSession, cancel: &CancellationToken) -> Result<FileRecord> {
        let parts = SessionRepository::new(self.ctx.db()).parts(&session.upload_id).await?;

        let missing: Vec<u32> = (1..=session.total_chunks)
            .filter(|n| parts.binary_search_by_key(n, |p| p.chunk_number).is_err())
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::IncompleteUpload { missing });
        }

        let extension = layout::extension_of(&session.file_name);
        let relative_path = layout::blob_path(&session.file_type, &session.content_hash, &extension);

        let store = self.ctx.store().clone();
        let scratch: Vec<String> = parts.into_iter().map(|p| p.scratch_path).collect();
        let chunks = stream::iter(scratch)
            .then(move |path| {
                let store = store.clone();
                async move {
                    store
                        .open_read(&path)
                        .await
                        .map(ReaderStream::new)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                }
            })
            .try_flatten()
            .boxed();

        let mut reader = HashingReader::new(StreamReader::<_, Bytes>::new(chunks));
        let store = self.ctx.store().as_ref();

        if let Err(e) = write_or_cancel(store, &relative_path, &mut reader, cancel).await {
            discard(store, &relative_path).await;
            return Err(e);
        }

        let (actual_hash, size) = reader.finish();
        if size != session.file_size {
            discard(store, &relative_path).await;
            tracing::warn!(
                upload_id = %session.upload_id,
                expected = session.file_size,
                actual = size,
                "Merged size mismatch"
            );
            return Err(IntegrityError::SizeMismatch {
                expected: session.file_size,
                actual: size,
            }
            .into());
        }

        if self.ctx.config().ingest.verify_merged_hash && actual_hash != session.content_hash {
            discard(store, &relative_path).await;
            tracing::warn!(
                upload_id = %session.upload_id,
                expected = %session.content_hash,
                actual = %actual_hash,
                "Merged hash mismatch"
            );
            return Err(IntegrityError::HashMismatch {
                expected: session.content_hash.clone(),
                actual: actual_hash,
            }
            .into());
        }

        let new_record = NewFileRecord {
            name: session.file_name.clone(),
            content_type: session.file_type.clone(),
            extension,
            absolute_url: layout::absolute_url(&self.ctx.config().storage.base_url, &relative_path),
            relative_path,
            content_hash: session.content_hash.clone(),
            size,
        };

        match self.index.insert_or_fetch(&new_record).await {
            Ok(Stored::Created(record)) => {
                tracing::info!(
                    upload_id = %session.upload_id,
                    file_id = %record.id,
                    chunks = session.total_chunks,
                    size = size,
                    "Chunks assembled"
                );
                Ok(record)
            }
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
