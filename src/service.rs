//! Transport-agnostic operation surface
//!
//! [`IngestService`] is what a transport layer (HTTP, RPC, CLI) sits on.
//! It is cheap to clone and safe to share across tasks.

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::db::FileRecord;
use crate::error::Result;
use crate::state::IngestContext;
use crate::upload::{
    ChunkRegistration, DirectUpload, DirectUploader, ListPage, ListQuery, ReadHandle,
    RecordManager, SessionManager, SessionProgress, SweepStats,
};

#[derive(Clone)]
pub struct IngestService {
    ctx: IngestContext,
    direct: DirectUploader,
    sessions: SessionManager,
    records: RecordManager,
}

impl IngestService {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            direct: DirectUploader::new(ctx.clone()),
            sessions: SessionManager::new(ctx.clone()),
            records: RecordManager::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &IngestContext {
        &self.ctx
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    pub async fn upload_direct<R>(
        &self,
        request: &DirectUpload,
        source: R,
        cancel: &CancellationToken,
    ) -> Result<FileRecord>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.direct.upload(request, source, cancel).await
    }

    pub async fn register_chunk<R>(
        &self,
        chunk: &ChunkRegistration,
        source: R,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.sessions.register_chunk(chunk, source, cancel).await
    }

    pub async fn complete_upload(
        &self,
        upload_id: &str,
        total_chunks: u32,
        cancel: &CancellationToken,
    ) -> Result<FileRecord> {
        self.sessions.complete_upload(upload_id, total_chunks, cancel).await
    }

    pub async fn session_status(&self, upload_id: &str) -> Result<SessionProgress> {
        self.sessions.session_status(upload_id).await
    }

    pub async fn cancel_session(&self, upload_id: &str) -> Result<()> {
        self.sessions.cancel_session(upload_id).await
    }

    // ========================================================================
    // Records
    // ========================================================================

    pub async fn get_record(&self, id: &str) -> Result<FileRecord> {
        self.records.get(id).await
    }

    pub async fn list_records(&self, query: &ListQuery) -> Result<ListPage> {
        self.records.list(query).await
    }

    pub async fn disable(&self, id: &str, reason: &str) -> Result<FileRecord> {
        self.records.disable(id, reason).await
    }

    pub async fn soft_delete(&self, id: &str) -> Result<FileRecord> {
        self.records.soft_delete(id).await
    }

    pub async fn resolve_read(&self, id: &str) -> Result<ReadHandle> {
        self.records.resolve_read(id).await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one retention sweep now
    pub async fn sweep(&self) -> Result<SweepStats> {
        self.sessions.sweep().await
    }

    /// Run the retention janitor until `shutdown` fires
    pub fn start_janitor(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.sessions.clone().start_cleanup_task(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send + 'static>(_: T) {}

    /// Fails to compile if an operation future cannot be spawned
    #[allow(dead_code)]
    fn operations_can_be_spawned(service: IngestService, cancel: CancellationToken) {
        let s = service.clone();
        let c = cancel.clone();
        assert_send(async move { s.complete_upload("upload", 1, &c).await });

        let s = service.clone();
        let c = cancel.clone();
        assert_send(async move {
            let request = DirectUpload {
                file_name: "a.png".to_string(),
                file_type: "image".to_string(),
                declared_size: 1,
            };
            s.upload_direct(&request, &b"a"[..], &c).await
        });

        assert_send(async move { service.sweep().await });
    }
}
