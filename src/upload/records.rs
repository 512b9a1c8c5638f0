//! File record lifecycle: lookup, listing, disable, soft delete and reads

use crate::db::{FileRecord, FileRepository};
use crate::error::{ConflictKind, IngestError, Result, ValidationError};
use crate::state::IngestContext;

use super::types::{ListPage, ListQuery, ReadHandle};

/// Operations on stored file records
#[derive(Clone)]
pub struct RecordManager {
    ctx: IngestContext,
}

impl RecordManager {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    fn files(&self) -> FileRepository<'_> {
        FileRepository::new(self.ctx.db())
    }

    /// Get a record in any state
    pub async fn get(&self, id: &str) -> Result<FileRecord> {
        self.files()
            .get(id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("file {}", id)))
    }

    /// List records; pagination is validated before the store is queried
    pub async fn list(&self, query: &ListQuery) -> Result<ListPage> {
        let (limit, offset) = query.bounds()?;
        let (records, total) = self.files().list(&query.filter, limit, offset).await?;

        Ok(ListPage {
            records,
            total: total.max(0) as u64,
            page: query.page,
            page_size: query.page_size,
        })
    }

    /// Block a record from reuse and reads; its bytes stay in place
    pub async fn disable(&self, id: &str, reason: &str) -> Result<FileRecord> {
        if reason.trim().is_empty() {
            return Err(ValidationError::MissingField("reason").into());
        }
        if !self.files().disable(id, reason).await? {
            return Err(IngestError::NotFound(format!("file {}", id)));
        }

        tracing::info!(file_id = %id, reason = %reason, "File disabled");
        self.get(id).await
    }

    /// Hide a record from default listings and reuse until it is uploaded again
    pub async fn soft_delete(&self, id: &str) -> Result<FileRecord> {
        if !self.files().soft_delete(id).await? {
            return Err(IngestError::NotFound(format!("file {}", id)));
        }

        tracing::info!(file_id = %id, "File soft-deleted");
        self.get(id).await
    }

    /// Decide how a record's bytes are delivered.
    ///
    /// Records at or below the stream threshold resolve to a filesystem
    /// path when the backend has one; everything else is streamed.
    pub async fn resolve_read(&self, id: &str) -> Result<ReadHandle> {
        let record = self.get(id).await?;

        if record.is_deleted() {
            return Err(IngestError::NotFound(format!("file {}", id)));
        }
        if record.is_disabled() {
            return Err(ConflictKind::FileDisabled(record.id).into());
        }

        let store = self.ctx.store();
        if record.size <= self.ctx.config().ingest.stream_read_threshold {
            if let Some(path) = store.local_path(&record.relative_path) {
                return Ok(ReadHandle::Path(path));
            }
        }

        let reader = store.open_read(&record.relative_path).await?;
        Ok(ReadHandle::Stream {
            reader,
            size: record.size,
        })
    }
}
