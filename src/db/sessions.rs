//! Chunk session database operations
//!
//! Session state only moves forward. Every transition is a conditional
//! update on the current state, so exactly one caller wins each one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;

/// Chunked upload session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// Accepting chunks
    Open,
    /// Claimed for assembly by one caller
    Complete,
    /// Assembled (or deduplicated) into a file record
    Merged,
    /// Assembly aborted or the upload was rejected
    Failed,
    /// Cancelled by the client or expired by the janitor
    Abandoned,
}

impl SessionState {
    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Abandoned)
    }
}

/// A grouping of chunk parts awaiting assembly
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChunkSession {
    pub upload_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: String,
    #[sqlx(try_from = "i64")]
    pub file_size: u64,
    pub content_hash: String,
    pub state: SessionState,
    /// Record the session resolved to once merged
    pub file_id: Option<String>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub purged_at: Option<DateTime<Utc>>,

    /// Chunk numbers received so far, ascending
    #[sqlx(skip)]
    pub received_chunks: Vec<u32>,
}

impl ChunkSession {
    /// Chunk numbers that still need to be uploaded
    pub fn missing_chunks(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|n| self.received_chunks.binary_search(n).is_err())
            .collect()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        let received = self.total_chunks as usize - self.missing_chunks().len();
        (received as f64 / self.total_chunks as f64) * 100.0
    }
}

/// Outcome of recording a chunk part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartUpsert {
    /// The session no longer accepts chunks
    Closed,
    /// Recorded, with the scratch path of the copy it replaced
    Stored { replaced: Option<String> },
}

/// Fields captured from the first chunk registration
#[derive(Debug, Clone)]
pub struct NewChunkSession {
    pub upload_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub content_hash: String,
}

/// One received chunk
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkPart {
    pub upload_id: String,
    pub chunk_number: u32,
    pub scratch_path: String,
    #[sqlx(try_from = "i64")]
    pub size: u64,
    pub received_at: DateTime<Utc>,
}

/// Chunk session repository
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new OPEN session
    pub async fn create(&self, data: &NewChunkSession) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO chunk_sessions (upload_id, total_chunks, file_name, file_type,
                                        file_size, content_hash, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'OPEN', ?, ?)
            "#,
        )
        .bind(&data.upload_id)
        .bind(data.total_chunks)
        .bind(&data.file_name)
        .bind(&data.file_type)
        .bind(data.file_size as i64)
        .bind(&data.content_hash)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Get a session with its received chunk numbers
    pub async fn get(&self, upload_id: &str) -> Result<Option<ChunkSession>> {
        let session = sqlx::query_as::<_, ChunkSession>(
            r#"
            SELECT upload_id, total_chunks, file_name, file_type, file_size, content_hash,
                   state, file_id, failure, created_at, updated_at, purged_at
            FROM chunk_sessions
            WHERE upload_id = ?
            "#,
        )
        .bind(upload_id)
        .fetch_optional(self.pool)
        .await?;

        let Some(mut session) = session else {
            return Ok(None);
        };

        session.received_chunks = sqlx::query_scalar::<_, u32>(
            "SELECT chunk_number FROM chunk_parts WHERE upload_id = ? ORDER BY chunk_number ASC",
        )
        .bind(upload_id)
        .fetch_all(self.pool)
        .await?;

        Ok(Some(session))
    }

    /// Record a chunk, replacing any earlier registration of the same number.
    ///
    /// Nothing is written once the session has left OPEN.
    pub async fn upsert_part(
        &self,
        upload_id: &str,
        chunk_number: u32,
        scratch_path: &str,
        size: u64,
    ) -> Result<PartUpsert> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads
        let touched = sqlx::query(
            "UPDATE chunk_sessions SET updated_at = ? WHERE upload_id = ? AND state = 'OPEN'",
        )
        .bind(now)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

        if touched.rows_affected() == 0 {
            return Ok(PartUpsert::Closed);
        }

        let replaced = sqlx::query_scalar::<_, String>(
            "SELECT scratch_path FROM chunk_parts WHERE upload_id = ? AND chunk_number = ?",
        )
        .bind(upload_id)
        .bind(chunk_number)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_parts (upload_id, chunk_number, scratch_path, size, received_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, chunk_number) DO UPDATE SET
                scratch_path = excluded.scratch_path,
                size = excluded.size,
                received_at = excluded.received_at
            "#,
        )
        .bind(upload_id)
        .bind(chunk_number)
        .bind(scratch_path)
        .bind(size as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PartUpsert::Stored { replaced })
    }

    /// Received parts ordered by chunk number
    pub async fn parts(&self, upload_id: &str) -> Result<Vec<ChunkPart>> {
        let parts = sqlx::query_as::<_, ChunkPart>(
            r#"
            SELECT upload_id, chunk_number, scratch_path, size, received_at
            FROM chunk_parts
            WHERE upload_id = ?
            ORDER BY chunk_number ASC
            "#,
        )
        .bind(upload_id)
        .fetch_all(self.pool)
        .await?;

        Ok(parts)
    }

    /// Move a session from `from` to `to` if it is still in `from`.
    ///
    /// Returns `true` only for the single caller whose update applied.
    pub async fn transition(&self, upload_id: &str, from: SessionState, to: SessionState) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chunk_sessions SET state = ?, updated_at = ? WHERE upload_id = ? AND state = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(from)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// COMPLETE -> MERGED, remembering the resulting record
    pub async fn mark_merged(&self, upload_id: &str, file_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_sessions SET state = 'MERGED', file_id = ?, updated_at = ?
            WHERE upload_id = ? AND state = 'COMPLETE'
            "#,
        )
        .bind(file_id)
        .bind(Utc::now())
        .bind(upload_id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// COMPLETE -> FAILED with a reason
    pub async fn mark_failed(&self, upload_id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chunk_sessions SET state = 'FAILED', failure = ?, updated_at = ?
            WHERE upload_id = ? AND state = 'COMPLETE'
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(upload_id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop chunk bookkeeping and stamp the session as purged
    pub async fn mark_purged(&self, upload_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE chunk_sessions SET purged_at = ? WHERE upload_id = ?")
            .bind(Utc::now())
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Ids of sessions in `state` not touched since `cutoff`
    pub async fn idle_since(&self, state: SessionState, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT upload_id FROM chunk_sessions WHERE state = ? AND updated_at < ?",
        )
        .bind(state)
        .bind(cutoff)
        .fetch_all(self.pool)
        .await?;

        Ok(ids)
    }

    /// Terminal sessions whose scratch data has not been purged yet
    pub async fn unpurged_terminal(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT upload_id FROM chunk_sessions
            WHERE state IN ('MERGED', 'FAILED', 'ABANDONED') AND purged_at IS NULL
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(ids)
    }

    /// Forget purged sessions last updated before `cutoff`
    pub async fn delete_purged_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM chunk_sessions WHERE purged_at IS NOT NULL AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
