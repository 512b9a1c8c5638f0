//! Deduplication Service
//!
//! File-level deduplication keyed by (content hash, content type). The
//! metadata store's uniqueness constraint is the only source of truth, so
//! there is no in-memory hash cache to go stale when a record is disabled
//! or deleted.

use sqlx::SqlitePool;

use crate::db::{FileRecord, FileRepository, NewFileRecord};
use crate::error::{ConflictKind, IngestError, Result};

/// Outcome of an insert-or-fetch
#[derive(Debug)]
pub enum Stored {
    /// The new record was created
    Created(FileRecord),
    /// Another record already held the (hash, type) pair; the caller's
    /// bytes are now unreferenced
    Existing(FileRecord),
}

/// Lookup view over file records by content hash
#[derive(Clone)]
pub struct HashIndex {
    db: SqlitePool,
}

impl HashIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    fn files(&self) -> FileRepository<'_> {
        FileRepository::new(&self.db)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Record eligible for reuse: neither disabled nor soft-deleted
    pub async fn find_active(&self, content_hash: &str, content_type: &str) -> Result<Option<FileRecord>> {
        self.files().find_active(content_hash, content_type).await
    }

    /// Record for the pair in any state
    pub async fn find_any(&self, content_hash: &str, content_type: &str) -> Result<Option<FileRecord>> {
        self.files().find_by_hash(content_hash, content_type).await
    }

    // ========================================================================
    // Reuse Policy
    // ========================================================================

    /// Decide what an upload matching `existing` resolves to.
    ///
    /// Disabled records reject the upload, soft-deleted ones are
    /// resurrected, active ones are returned unchanged.
    pub async fn reuse(&self, existing: FileRecord) -> Result<FileRecord> {
        if existing.is_disabled() {
            tracing::info!(
                file_id = %existing.id,
                content_hash = %existing.content_hash,
                "Upload rejected, matching file is disabled"
            );
            return Err(ConflictKind::FileDisabled(existing.id).into());
        }

        if existing.is_deleted() {
            let record = self
                .files()
                .resurrect(&existing.id)
                .await?
                .ok_or_else(|| IngestError::NotFound(format!("file {}", existing.id)))?;

            // A concurrent disable can land between the read and the update
            if record.is_disabled() {
                return Err(ConflictKind::FileDisabled(record.id).into());
            }

            tracing::info!(file_id = %record.id, "Resurrected soft-deleted file on reupload");
            return Ok(record);
        }

        tracing::debug!(file_id = %existing.id, "Duplicate upload resolved to existing file");
        Ok(existing)
    }

    /// Create `data` unless its (hash, type) pair is taken, in which case
    /// the reuse policy is applied to the record that holds it
    pub async fn insert_or_fetch(&self, data: &NewFileRecord) -> Result<Stored> {
        let files = self.files();

        if let Some(record) = files.insert_if_absent(data).await? {
            tracing::info!(
                file_id = %record.id,
                content_type = %record.content_type,
                size = record.size,
                path = %record.relative_path,
                "File record created"
            );
            return Ok(Stored::Created(record));
        }

        let winner = files
            .find_by_hash(&data.content_hash, &data.content_type)
            .await?
            .ok_or_else(|| {
                IngestError::NotFound(format!(
                    "file with hash {} and type {}",
                    data.content_hash, data.content_type
                ))
            })?;

        tracing::debug!(file_id = %winner.id, "Lost insert race, using existing file");
        Ok(Stored::Existing(self.reuse(winner).await?))
    }
}
