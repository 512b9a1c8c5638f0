//! Upload Session Manager
//!
//! Manages chunked upload sessions with:
//! - Chunk registration in any order, with overwrite-by-number retries
//! - Single-winner completion backed by a conditional state update
//! - Background scratch purge and a retention janitor

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{
    ChunkSession, FileRecord, FileRepository, NewChunkSession, PartUpsert, SessionRepository,
    SessionState,
};
use crate::error::{ConflictKind, IngestError, Result, ValidationError};
use crate::state::IngestContext;

use super::assembler::Assembler;
use super::deduplication::HashIndex;
use super::types::{
    normalize_hash, validate_file_name, validate_file_type, ChunkRegistration, SessionProgress,
};
use super::{discard, layout, write_or_cancel};

/// How often a caller that lost the completion race re-reads the session
const MERGE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What one janitor pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Idle OPEN sessions moved to ABANDONED
    pub abandoned: usize,
    /// Stuck COMPLETE sessions moved to FAILED
    pub failed: usize,
    /// Terminal sessions whose scratch data was removed
    pub purged: usize,
    /// Purged session rows deleted
    pub forgotten: u64,
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages chunked upload sessions
#[derive(Clone)]
pub struct SessionManager {
    ctx: IngestContext,
    index: HashIndex,
    assembler: Assembler,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            index: HashIndex::new(ctx.db().clone()),
            assembler: Assembler::new(ctx.clone()),
            ctx,
        }
    }

    fn sessions(&self) -> SessionRepository<'_> {
        SessionRepository::new(self.ctx.db())
    }

    async fn load(&self, upload_id: &str) -> Result<ChunkSession> {
        self.sessions()
            .get(upload_id)
            .await?
            .ok_or_else(|| session_not_found(upload_id))
    }

    // ========================================================================
    // Chunk Registration
    // ========================================================================

    /// Store one chunk and return the session's upload id.
    ///
    /// The first chunk (no upload id) opens a new session. Registering a
    /// chunk number again replaces the earlier bytes.
    pub async fn register_chunk<R>(
        &self,
        chunk: &ChunkRegistration,
        source: R,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        R: AsyncRead + Send + Unpin,
    {
        validate_position(chunk)?;
        let content_hash = self.validate_metadata(chunk)?;
        let sessions = self.sessions();

        let (upload_id, is_new) = match &chunk.upload_id {
            None => (Uuid::new_v4().to_string(), true),
            Some(upload_id) => {
                let upload_id = parse_upload_id(upload_id)?;
                let session = self.load(&upload_id).await?;
                if session.state != SessionState::Open {
                    return Err(ConflictKind::SessionClosed(upload_id).into());
                }
                ensure_same_upload(&session, chunk, &content_hash)?;
                (upload_id, false)
            }
        };

        // A short or cancelled retry leaves the earlier copy in place
        let store = self.ctx.store().as_ref();
        let scratch = layout::chunk_path(&upload_id, chunk.chunk_number);
        let mut reader = source.take(chunk.declared_chunk_len.saturating_add(1));

        let received = match write_or_cancel(store, &scratch, &mut reader, cancel).await {
            Ok(received) => received,
            Err(e) => {
                discard(store, &scratch).await;
                return Err(e);
            }
        };

        if received != chunk.declared_chunk_len {
            discard(store, &scratch).await;
            return Err(ValidationError::ChunkSizeMismatch {
                declared: chunk.declared_chunk_len,
                actual: received,
            }
            .into());
        }

        if is_new {
            let created = sessions
                .create(&NewChunkSession {
                    upload_id: upload_id.clone(),
                    total_chunks: chunk.total_chunks,
                    file_name: chunk.file_name.clone(),
                    file_type: chunk.file_type.clone(),
                    file_size: chunk.file_size,
                    content_hash,
                })
                .await;

            if let Err(e) = created {
                discard(store, &scratch).await;
                return Err(e);
            }

            tracing::info!(
                upload_id = %upload_id,
                file_name = %chunk.file_name,
                file_size = chunk.file_size,
                chunks = chunk.total_chunks,
                "Created upload session"
            );
        }

        // The part row only ever points at fully written bytes
        match sessions
            .upsert_part(&upload_id, chunk.chunk_number, &scratch, received)
            .await
        {
            Ok(PartUpsert::Stored { replaced }) => {
                if let Some(replaced) = replaced {
                    discard(store, &replaced).await;
                }
            }
            Ok(PartUpsert::Closed) => {
                discard(store, &scratch).await;
                return Err(ConflictKind::SessionClosed(upload_id).into());
            }
            Err(e) => {
                discard(store, &scratch).await;
                return Err(e);
            }
        }

        tracing::debug!(
            upload_id = %upload_id,
            chunk_number = chunk.chunk_number,
            size = received,
            "Chunk registered"
        );

        Ok(upload_id)
    }

    fn validate_metadata(&self, chunk: &ChunkRegistration) -> Result<String> {
        validate_file_type(&chunk.file_type)?;
        validate_file_name(&chunk.file_name)?;
        let content_hash = normalize_hash(&chunk.content_hash)?;

        let max = self.ctx.config().ingest.max_file_size;
        if chunk.file_size == 0 {
            return Err(IngestError::invalid("file_size", "must be positive"));
        }
        if chunk.file_size > max {
            return Err(ValidationError::FileTooLarge {
                size: chunk.file_size,
                max,
            }
            .into());
        }
        // Every chunk carries at least one byte
        if u64::from(chunk.total_chunks) > chunk.file_size {
            return Err(IngestError::invalid(
                "total_chunks",
                "more chunks than bytes in the file",
            ));
        }
        if chunk.declared_chunk_len > chunk.file_size {
            return Err(IngestError::invalid(
                "declared_chunk_len",
                "larger than the whole file",
            ));
        }

        Ok(content_hash)
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Finish a session: deduplicate against stored files or assemble its
    /// chunks, and return the resulting record.
    ///
    /// Only one caller ever assembles a session. Others wait for that
    /// caller's outcome, and repeating the call after a merge returns the
    /// same record.
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        expected_total: u32,
        cancel: &CancellationToken,
    ) -> Result<FileRecord> {
        let upload_id = parse_upload_id(upload_id)?;
        let session = self.load(&upload_id).await?;

        match session.state {
            SessionState::Open => {}
            SessionState::Complete => return self.await_outcome(&upload_id, cancel).await,
            _ => return self.settled(&session).await,
        }

        if expected_total != session.total_chunks {
            return Err(ValidationError::MetadataMismatch("total_chunks").into());
        }

        let missing = session.missing_chunks();
        if !missing.is_empty() {
            return Err(IngestError::IncompleteUpload { missing });
        }

        let sessions = self.sessions();
        if !sessions
            .transition(&upload_id, SessionState::Open, SessionState::Complete)
            .await?
        {
            tracing::debug!(upload_id = %upload_id, "Completion already claimed, waiting");
            return self.await_outcome(&upload_id, cancel).await;
        }

        tracing::info!(upload_id = %upload_id, "Upload session claimed for assembly");

        let outcome = self.resolve_claimed(&session, cancel).await;
        match &outcome {
            Ok(record) => {
                match sessions.mark_merged(&upload_id, &record.id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(upload_id = %upload_id, "Session left COMPLETE before merge finished");
                    }
                    Err(e) => {
                        tracing::error!(upload_id = %upload_id, error = %e, "Failed to record merged session");
                    }
                }
                tracing::info!(upload_id = %upload_id, file_id = %record.id, "Upload session merged");
            }
            Err(e) => {
                if let Err(mark_err) = sessions.mark_failed(&upload_id, &e.to_string()).await {
                    tracing::error!(
                        upload_id = %upload_id,
                        error = %mark_err,
                        "Failed to record session failure, janitor will expire it"
                    );
                }
                tracing::warn!(upload_id = %upload_id, error = %e, "Upload session failed");
            }
        }

        self.spawn_purge(upload_id);
        outcome
    }

    async fn resolve_claimed(&self, session: &ChunkSession, cancel: &CancellationToken) -> Result<FileRecord> {
        let existing = self
            .index
            .find_any(&session.content_hash, &session.file_type)
            .await?;

        if let Some(existing) = existing {
            tracing::info!(
                upload_id = %session.upload_id,
                file_id = %existing.id,
                "Chunked upload matches stored file"
            );
            return self.index.reuse(existing).await;
        }

        self.assembler.merge(session, cancel).await
    }

    /// Poll until another caller's claim settles
    async fn await_outcome(&self, upload_id: &str, cancel: &CancellationToken) -> Result<FileRecord> {
        let deadline = Instant::now() + self.ctx.config().ingest.merge_wait_timeout();

        loop {
            let session = self.load(upload_id).await?;
            if session.state.is_terminal() {
                return self.settled(&session).await;
            }
            if Instant::now() >= deadline {
                return Err(ConflictKind::MergeInProgress(upload_id.to_string()).into());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(MERGE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Result a terminal session resolves to
    async fn settled(&self, session: &ChunkSession) -> Result<FileRecord> {
        match session.state {
            SessionState::Merged => {
                let file_id = session
                    .file_id
                    .as_deref()
                    .ok_or_else(|| IngestError::NotFound(format!("file for upload {}", session.upload_id)))?;
                FileRepository::new(self.ctx.db())
                    .get(file_id)
                    .await?
                    .ok_or_else(|| IngestError::NotFound(format!("file {}", file_id)))
            }
            SessionState::Failed => Err(ConflictKind::SessionFailed {
                id: session.upload_id.clone(),
                reason: session.failure.clone().unwrap_or_default(),
            }
            .into()),
            _ => Err(ConflictKind::SessionClosed(session.upload_id.clone()).into()),
        }
    }

    // ========================================================================
    // Status & Cancellation
    // ========================================================================

    /// Get a session's received and missing chunks
    pub async fn session_status(&self, upload_id: &str) -> Result<SessionProgress> {
        let upload_id = parse_upload_id(upload_id)?;
        let session = self.load(&upload_id).await?;
        Ok(SessionProgress::from(&session))
    }

    /// Abandon an OPEN session and drop its scratch data
    pub async fn cancel_session(&self, upload_id: &str) -> Result<()> {
        let upload_id = parse_upload_id(upload_id)?;
        let sessions = self.sessions();

        if !sessions
            .transition(&upload_id, SessionState::Open, SessionState::Abandoned)
            .await?
        {
            let session = self.load(&upload_id).await?;
            if session.state != SessionState::Abandoned {
                return Err(ConflictKind::SessionClosed(upload_id).into());
            }
        }

        self.purge(&upload_id).await?;
        tracing::info!(upload_id = %upload_id, "Cancelled upload session");

        Ok(())
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove a session's scratch directory and chunk bookkeeping
    ///
    /// Returns the number of scratch blobs removed
    pub(crate) async fn purge(&self, upload_id: &str) -> Result<usize> {
        let removed = self
            .ctx
            .store()
            .remove_tree(&layout::chunk_dir(upload_id))
            .await?;
        self.sessions().mark_purged(upload_id).await?;

        tracing::debug!(upload_id = %upload_id, removed = removed, "Purged session scratch data");
        Ok(removed)
    }

    fn spawn_purge(&self, upload_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.purge(&upload_id).await {
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %e,
                    "Scratch purge failed, janitor will retry"
                );
            }
        });
    }

    /// Run one janitor pass over expired and unpurged sessions
    pub async fn sweep(&self) -> Result<SweepStats> {
        let cutoff = Utc::now() - self.ctx.config().ingest.session_retention();
        let sessions = self.sessions();
        let mut stats = SweepStats::default();

        for upload_id in sessions.idle_since(SessionState::Open, cutoff).await? {
            if sessions
                .transition(&upload_id, SessionState::Open, SessionState::Abandoned)
                .await?
            {
                tracing::debug!(upload_id = %upload_id, "Abandoned idle upload session");
                stats.abandoned += 1;
            }
        }

        for upload_id in sessions.idle_since(SessionState::Complete, cutoff).await? {
            if sessions
                .mark_failed(&upload_id, "assembly did not finish within the retention window")
                .await?
            {
                tracing::warn!(upload_id = %upload_id, "Failed stuck upload session");
                stats.failed += 1;
            }
        }

        for upload_id in sessions.unpurged_terminal().await? {
            match self.purge(&upload_id).await {
                Ok(_) => stats.purged += 1,
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, error = %e, "Janitor purge failed");
                }
            }
        }

        stats.forgotten = sessions.delete_purged_before(cutoff).await?;

        if stats != SweepStats::default() {
            tracing::info!(
                abandoned = stats.abandoned,
                failed = stats.failed,
                purged = stats.purged,
                forgotten = stats.forgotten,
                "Janitor sweep finished"
            );
        }

        Ok(stats)
    }

    /// Start background cleanup task, stopped by `shutdown`
    pub fn start_cleanup_task(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.ctx.config().ingest.janitor_interval());

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::warn!(error = %e, "Janitor sweep failed");
                        }
                    }
                }
            }

            tracing::info!("Janitor stopped");
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn session_not_found(upload_id: &str) -> IngestError {
    IngestError::NotFound(format!("upload session {}", upload_id))
}

/// Upload ids are minted as UUIDs; anything else cannot name a session
fn parse_upload_id(upload_id: &str) -> Result<String> {
    Uuid::parse_str(upload_id)
        .map(|id| id.to_string())
        .map_err(|_| session_not_found(upload_id))
}

fn validate_position(chunk: &ChunkRegistration) -> Result<()> {
    if chunk.total_chunks == 0 {
        return Err(IngestError::invalid("total_chunks", "must be at least 1"));
    }
    if chunk.chunk_number == 0 || chunk.chunk_number > chunk.total_chunks {
        return Err(ValidationError::ChunkOutOfRange {
            chunk_number: chunk.chunk_number,
            total_chunks: chunk.total_chunks,
        }
        .into());
    }
    Ok(())
}

fn ensure_same_upload(session: &ChunkSession, chunk: &ChunkRegistration, content_hash: &str) -> Result<()> {
    let mismatch = if session.total_chunks != chunk.total_chunks {
        Some("total_chunks")
    } else if session.file_type != chunk.file_type {
        Some("file_type")
    } else if session.file_size != chunk.file_size {
        Some("file_size")
    } else if session.content_hash != content_hash {
        Some("content_hash")
    } else {
        None
    };

    match mismatch {
        Some(field) => Err(ValidationError::MetadataMismatch(field).into()),
        None => Ok(()),
    }
}
