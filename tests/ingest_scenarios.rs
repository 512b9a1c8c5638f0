//! End-to-end ingestion scenarios against a local blob store and a
//! temporary SQLite database.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use ingest_server::config::{Config, StorageBackend};
use ingest_server::db::{DeletedFilter, DeletedState, FileFilter, FileStatus, SessionState};
use ingest_server::error::{ConflictKind, IngestError, IntegrityError, ValidationError};
use ingest_server::upload::{compute_hash, ChunkRegistration, DirectUpload, ListQuery, ReadHandle};
use ingest_server::{IngestContext, IngestService};

const MIB: usize = 1024 * 1024;

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    service: IngestService,
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("blobs");

    let mut config = Config::default();
    config.database.url = format!("sqlite://{}", dir.path().join("ingest.db").display());
    config.storage.backend = StorageBackend::Local { root: root.clone() };
    config.storage.base_url = "http://files.test/".to_string();
    config.ingest.direct_upload_max_bytes = MIB as u64;
    tweak(&mut config);

    let ctx = IngestContext::connect(config).await.unwrap();
    Harness {
        _dir: dir,
        root,
        service: IngestService::new(ctx),
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn direct(file_type: &str, data: &[u8]) -> DirectUpload {
    DirectUpload {
        file_name: "upload.png".to_string(),
        file_type: file_type.to_string(),
        declared_size: data.len() as u64,
    }
}

fn chunk_request(
    upload_id: Option<&str>,
    chunk_number: u32,
    total_chunks: u32,
    chunk: &[u8],
    file_type: &str,
    whole: &[u8],
) -> ChunkRegistration {
    ChunkRegistration {
        upload_id: upload_id.map(str::to_string),
        chunk_number,
        total_chunks,
        declared_chunk_len: chunk.len() as u64,
        file_name: "movie.mp4".to_string(),
        file_type: file_type.to_string(),
        file_size: whole.len() as u64,
        content_hash: compute_hash(whole),
    }
}

/// Register `chunks` (1-based number, bytes) in the given order
async fn register_all(
    service: &IngestService,
    file_type: &str,
    whole: &[u8],
    total: u32,
    chunks: &[(u32, &[u8])],
) -> String {
    let cancel = CancellationToken::new();
    let mut upload_id: Option<String> = None;

    for (number, bytes) in chunks {
        let request = chunk_request(upload_id.as_deref(), *number, total, bytes, file_type, whole);
        let id = service.register_chunk(&request, *bytes, &cancel).await.unwrap();
        upload_id = Some(id);
    }

    upload_id.unwrap()
}

/// Regular files directly inside `root/dir`, ignoring missing directories
fn files_in(root: &Path, dir: &str) -> Vec<PathBuf> {
    match std::fs::read_dir(root.join(dir)) {
        Ok(entries) => entries
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_until_gone(path: &Path) {
    for _ in 0..250 {
        if !path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} was never removed", path.display());
}

async fn read_record(service: &IngestService, id: &str) -> Vec<u8> {
    match service.resolve_read(id).await.unwrap() {
        ReadHandle::Path(path) => tokio::fs::read(path).await.unwrap(),
        ReadHandle::Stream { mut reader, .. } => {
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
            buf
        }
    }
}

// ============================================================================
// Chunked Uploads
// ============================================================================

#[tokio::test]
async fn test_out_of_order_chunks_merge_in_number_order() {
    let h = harness().await;
    let one = pattern(MIB, 1);
    let two = pattern(MIB, 2);
    let three = pattern(MIB / 2, 3);
    let whole = [one.clone(), two.clone(), three.clone()].concat();
    assert_eq!(whole.len(), 2_621_440);

    let upload_id = register_all(
        &h.service,
        "video",
        &whole,
        3,
        &[(3, &three[..]), (1, &one[..]), (2, &two[..])],
    )
    .await;

    let record = h
        .service
        .complete_upload(&upload_id, 3, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.size, 2_621_440);
    assert_eq!(record.content_hash, compute_hash(&whole));
    assert_eq!(record.extension, "mp4");
    assert!(record.relative_path.starts_with("video/"));
    assert_eq!(
        record.absolute_url,
        format!("http://files.test/{}", record.relative_path)
    );
    assert_eq!(read_record(&h.service, &record.id).await, whole);

    wait_until_gone(&h.root.join("chunks").join(&upload_id)).await;

    let status = h.service.session_status(&upload_id).await.unwrap();
    assert_eq!(status.state, SessionState::Merged);
    assert_eq!(status.file_id.as_deref(), Some(record.id.as_str()));
}

#[tokio::test]
async fn test_arrival_order_does_not_change_output() {
    let h = harness().await;
    let parts = [pattern(1000, 7), pattern(1000, 8), pattern(500, 9)];
    let whole = parts.concat();

    let in_order = register_all(
        &h.service,
        "clip",
        &whole,
        3,
        &[(1, &parts[0][..]), (2, &parts[1][..]), (3, &parts[2][..])],
    )
    .await;
    let shuffled = register_all(
        &h.service,
        "movie",
        &whole,
        3,
        &[(3, &parts[2][..]), (1, &parts[0][..]), (2, &parts[1][..])],
    )
    .await;

    let cancel = CancellationToken::new();
    let a = h.service.complete_upload(&in_order, 3, &cancel).await.unwrap();
    let b = h.service.complete_upload(&shuffled, 3, &cancel).await.unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(read_record(&h.service, &a.id).await, read_record(&h.service, &b.id).await);
}

#[tokio::test]
async fn test_reregistered_chunk_replaces_earlier_bytes() {
    let h = harness().await;
    let one = pattern(2048, 1);
    let stale = pattern(2048, 50);
    let fresh = pattern(2048, 99);
    let whole = [one.clone(), fresh.clone()].concat();

    let cancel = CancellationToken::new();
    let first = chunk_request(None, 1, 2, &one, "doc", &whole);
    let upload_id = h.service.register_chunk(&first, &one[..], &cancel).await.unwrap();

    for bytes in [&stale, &fresh] {
        let retry = chunk_request(Some(&upload_id), 2, 2, bytes, "doc", &whole);
        let id = h.service.register_chunk(&retry, &bytes[..], &cancel).await.unwrap();
        assert_eq!(id, upload_id);
    }

    // A short retry is rejected and keeps the good copy
    let retry = chunk_request(Some(&upload_id), 2, 2, &fresh, "doc", &whole);
    let err = h.service.register_chunk(&retry, &stale[..100], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(ValidationError::ChunkSizeMismatch { .. })));

    // Replaced copies are dropped, one file per chunk number remains
    let scratch = format!("chunks/{}", upload_id);
    assert_eq!(files_in(&h.root, &scratch).len(), 2);

    let status = h.service.session_status(&upload_id).await.unwrap();
    assert_eq!(status.received_chunks, vec![1, 2]);

    let record = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap();
    assert_eq!(read_record(&h.service, &record.id).await, whole);
}

#[tokio::test]
async fn test_complete_with_missing_chunk_is_rejected() {
    let h = harness().await;
    let parts = [pattern(100, 1), pattern(100, 2), pattern(100, 3)];
    let whole = parts.concat();

    let upload_id = register_all(&h.service, "doc", &whole, 3, &[(1, &parts[0][..]), (2, &parts[1][..])]).await;

    let err = h
        .service
        .complete_upload(&upload_id, 3, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::IncompleteUpload { ref missing } if missing == &vec![3]));
    assert_eq!(err.code(), "INCOMPLETE_UPLOAD");

    // Still open, so the missing chunk can be sent and the upload finished
    let request = chunk_request(Some(&upload_id), 3, 3, &parts[2], "doc", &whole);
    h.service
        .register_chunk(&request, &parts[2][..], &CancellationToken::new())
        .await
        .unwrap();
    let record = h
        .service
        .complete_upload(&upload_id, 3, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(record.size, 300);
}

#[tokio::test]
async fn test_chunk_validation() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let whole = pattern(300, 4);
    let chunk = pattern(100, 4);

    // Declared length disagrees with the bytes sent
    let mut request = chunk_request(None, 1, 3, &chunk, "doc", &whole);
    request.declared_chunk_len = 120;
    let err = h.service.register_chunk(&request, &chunk[..], &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::ChunkSizeMismatch { declared: 120, actual: 100 })
    ));

    // Out of range
    let request = chunk_request(None, 4, 3, &chunk, "doc", &whole);
    let err = h.service.register_chunk(&request, &chunk[..], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(ValidationError::ChunkOutOfRange { .. })));

    // More chunks than bytes can never complete
    let tiny = pattern(10, 4);
    let request = chunk_request(None, 1, 50_000_000, &tiny[..1], "doc", &tiny);
    let err = h.service.register_chunk(&request, &tiny[..1], &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::InvalidField { field: "total_chunks", .. })
    ));

    // Later chunks must agree with the first registration
    let request = chunk_request(None, 1, 3, &chunk, "doc", &whole);
    let upload_id = h.service.register_chunk(&request, &chunk[..], &cancel).await.unwrap();

    let mut request = chunk_request(Some(&upload_id), 2, 3, &chunk, "doc", &whole);
    request.file_size += 1;
    let err = h.service.register_chunk(&request, &chunk[..], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(ValidationError::MetadataMismatch("file_size"))));

    let request = chunk_request(Some(&upload_id), 2, 4, &chunk, "doc", &whole);
    let err = h.service.register_chunk(&request, &chunk[..], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(ValidationError::MetadataMismatch("total_chunks"))));

    // Unknown sessions
    let request = chunk_request(Some("not-a-session"), 2, 3, &chunk, "doc", &whole);
    let err = h.service.register_chunk(&request, &chunk[..], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::NotFound(_)));
}

#[tokio::test]
async fn test_concurrent_completion_merges_once() {
    let h = harness().await;
    let parts = [pattern(4096, 11), pattern(4096, 12), pattern(1024, 13)];
    let whole = parts.concat();
    let upload_id = register_all(
        &h.service,
        "archive",
        &whole,
        3,
        &[(1, &parts[0][..]), (2, &parts[1][..]), (3, &parts[2][..])],
    )
    .await;

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let service = h.service.clone();
        let upload_id = upload_id.clone();
        tasks.push(tokio::spawn(async move {
            service
                .complete_upload(&upload_id, 3, &CancellationToken::new())
                .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(files_in(&h.root, "archive").len(), 1);

    // Completing again after the merge returns the same record
    let again = h
        .service
        .complete_upload(&upload_id, 3, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.id, ids[0]);

    // A merged session takes no more chunks
    let request = chunk_request(Some(&upload_id), 1, 3, &parts[0], "archive", &whole);
    let err = h
        .service
        .register_chunk(&request, &parts[0][..], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Conflict(ConflictKind::SessionClosed(_))));
}

#[tokio::test]
async fn test_size_mismatch_creates_no_record() {
    let h = harness().await;
    let chunk = pattern(100, 21);
    // Declares 250 bytes but only 200 arrive
    let whole = pattern(250, 21);

    let cancel = CancellationToken::new();
    let first = chunk_request(None, 1, 2, &chunk, "doc", &whole);
    let upload_id = h.service.register_chunk(&first, &chunk[..], &cancel).await.unwrap();
    let second = chunk_request(Some(&upload_id), 2, 2, &chunk, "doc", &whole);
    h.service.register_chunk(&second, &chunk[..], &cancel).await.unwrap();

    let err = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Integrity(IntegrityError::SizeMismatch { expected: 250, actual: 200 })
    ));
    assert!(files_in(&h.root, "doc").is_empty());

    let mut query = ListQuery::new(1, 10);
    query.filter.deleted = DeletedFilter::All;
    assert_eq!(h.service.list_records(&query).await.unwrap().total, 0);

    let err = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Conflict(ConflictKind::SessionFailed { .. })));
    wait_until_gone(&h.root.join("chunks").join(&upload_id)).await;
}

#[tokio::test]
async fn test_merge_error_survives_failed_bookkeeping() {
    let h = harness().await;
    let chunk = pattern(100, 22);
    let whole = pattern(250, 22);

    let cancel = CancellationToken::new();
    let first = chunk_request(None, 1, 2, &chunk, "doc", &whole);
    let upload_id = h.service.register_chunk(&first, &chunk[..], &cancel).await.unwrap();
    let second = chunk_request(Some(&upload_id), 2, 2, &chunk, "doc", &whole);
    h.service.register_chunk(&second, &chunk[..], &cancel).await.unwrap();

    sqlx::query(
        r#"
        CREATE TRIGGER block_failed BEFORE UPDATE OF state ON chunk_sessions
        WHEN NEW.state = 'FAILED'
        BEGIN SELECT RAISE(ABORT, 'state update blocked'); END
        "#,
    )
    .execute(h.service.context().db())
    .await
    .unwrap();

    let err = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Integrity(IntegrityError::SizeMismatch { .. })));

    // Scratch is still purged and the janitor owns the stuck session
    wait_until_gone(&h.root.join("chunks").join(&upload_id)).await;
    assert_eq!(
        h.service.session_status(&upload_id).await.unwrap().state,
        SessionState::Complete
    );
}

#[tokio::test]
async fn test_hash_mismatch_creates_no_record() {
    let h = harness().await;
    let whole = pattern(300, 5);
    let mut request = chunk_request(None, 1, 1, &whole, "doc", &whole);
    request.content_hash = compute_hash(b"something else entirely");

    let cancel = CancellationToken::new();
    let upload_id = h.service.register_chunk(&request, &whole[..], &cancel).await.unwrap();
    let err = h.service.complete_upload(&upload_id, 1, &cancel).await.unwrap_err();

    assert_eq!(err.code(), "HASH_MISMATCH");
    assert!(files_in(&h.root, "doc").is_empty());
}

#[tokio::test]
async fn test_completion_deduplicates_against_direct_upload() {
    let h = harness().await;
    let whole = pattern(3000, 17);
    let cancel = CancellationToken::new();

    let stored = h
        .service
        .upload_direct(&direct("doc", &whole), &whole[..], &cancel)
        .await
        .unwrap();

    let upload_id = register_all(&h.service, "doc", &whole, 2, &[(2, &whole[1500..]), (1, &whole[..1500])]).await;
    let record = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap();

    assert_eq!(record.id, stored.id);
    assert_eq!(files_in(&h.root, "doc").len(), 1);
    wait_until_gone(&h.root.join("chunks").join(&upload_id)).await;
}

// ============================================================================
// Direct Uploads
// ============================================================================

#[tokio::test]
async fn test_direct_upload_is_idempotent() {
    let h = harness().await;
    let data = pattern(64 * 1024, 42);
    let cancel = CancellationToken::new();

    let first = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();
    let second = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.status, FileStatus::Normal);
    assert_eq!(first.deleted_state, DeletedState::Normal);
    assert_eq!(files_in(&h.root, "image").len(), 1);
    assert!(files_in(&h.root, "staging").is_empty());

    // Same bytes under another type are a separate record
    let other = h
        .service
        .upload_direct(&direct("avatar", &data), &data[..], &cancel)
        .await
        .unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_direct_uploads_create_one_record() {
    let h = harness().await;
    let data = pattern(200 * 1024, 3);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        let data = data.clone();
        tasks.push(tokio::spawn(async move {
            service
                .upload_direct(&direct("image", &data), &data[..], &CancellationToken::new())
                .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(files_in(&h.root, "image").len(), 1);
    assert!(files_in(&h.root, "staging").is_empty());
}

#[tokio::test]
async fn test_disabled_content_cannot_be_reuploaded() {
    let h = harness().await;
    let data = pattern(1000, 8);
    let cancel = CancellationToken::new();

    let record = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();
    let disabled = h.service.disable(&record.id, "policy violation").await.unwrap();
    assert_eq!(disabled.status, FileStatus::Disable);
    assert_eq!(disabled.disable_reason.as_deref(), Some("policy violation"));

    let err = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Conflict(ConflictKind::FileDisabled(ref id)) if id == &record.id));
    assert_eq!(files_in(&h.root, "image").len(), 1);
    assert!(files_in(&h.root, "staging").is_empty());

    // Metadata stays readable, bytes do not
    assert!(h.service.get_record(&record.id).await.is_ok());
    let err = h.service.resolve_read(&record.id).await.unwrap_err();
    assert_eq!(err.code(), "FILE_DISABLED");
}

#[tokio::test]
async fn test_soft_deleted_content_is_resurrected() {
    let h = harness().await;
    let data = pattern(1000, 9);
    let cancel = CancellationToken::new();

    let record = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();
    h.service.soft_delete(&record.id).await.unwrap();

    let listed = h.service.list_records(&ListQuery::new(1, 10)).await.unwrap();
    assert_eq!(listed.total, 0);
    assert!(matches!(
        h.service.resolve_read(&record.id).await.unwrap_err(),
        IngestError::NotFound(_)
    ));

    let revived = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();
    assert_eq!(revived.id, record.id);
    assert_eq!(revived.status, FileStatus::Normal);
    assert_eq!(revived.deleted_state, DeletedState::Normal);
    assert_eq!(revived.relative_path, record.relative_path);
    assert_eq!(files_in(&h.root, "image").len(), 1);
    assert_eq!(read_record(&h.service, &revived.id).await, data);
}

#[tokio::test]
async fn test_chunked_upload_of_disabled_content_fails() {
    let h = harness().await;
    let data = pattern(1000, 10);
    let cancel = CancellationToken::new();

    let record = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();
    h.service.disable(&record.id, "takedown").await.unwrap();

    let upload_id = register_all(&h.service, "image", &data, 2, &[(1, &data[..600]), (2, &data[600..])]).await;
    let err = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "FILE_DISABLED");

    wait_until_gone(&h.root.join("chunks").join(&upload_id)).await;
    assert_eq!(
        h.service.session_status(&upload_id).await.unwrap().state,
        SessionState::Failed
    );
    assert_eq!(files_in(&h.root, "image").len(), 1);

    // Asking again reports the recorded failure
    let err = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Conflict(ConflictKind::SessionFailed { .. })));
}

#[tokio::test]
async fn test_chunked_upload_resurrects_soft_deleted_content() {
    let h = harness().await;
    let data = pattern(1000, 11);
    let cancel = CancellationToken::new();

    let record = h
        .service
        .upload_direct(&direct("image", &data), &data[..], &cancel)
        .await
        .unwrap();
    h.service.soft_delete(&record.id).await.unwrap();

    let upload_id = register_all(&h.service, "image", &data, 2, &[(2, &data[600..]), (1, &data[..600])]).await;
    let revived = h.service.complete_upload(&upload_id, 2, &cancel).await.unwrap();
    assert_eq!(revived.id, record.id);
    assert_eq!(revived.deleted_state, DeletedState::Normal);
    assert_eq!(revived.relative_path, record.relative_path);

    wait_until_gone(&h.root.join("chunks").join(&upload_id)).await;
    let status = h.service.session_status(&upload_id).await.unwrap();
    assert_eq!(status.state, SessionState::Merged);
    assert_eq!(status.file_id.as_deref(), Some(record.id.as_str()));
    assert_eq!(files_in(&h.root, "image").len(), 1);
    assert_eq!(read_record(&h.service, &revived.id).await, data);
}

#[tokio::test]
async fn test_direct_upload_size_limits() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let big = DirectUpload {
        file_name: "big.bin".to_string(),
        file_type: "blob".to_string(),
        declared_size: (MIB + 1) as u64,
    };
    let err = h.service.upload_direct(&big, &b""[..], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::SizeExceeded { .. }));

    // Source longer than the limit despite a small declaration
    let data = pattern(MIB + 10, 1);
    let mut lying = direct("blob", &data);
    lying.declared_size = 10;
    let err = h.service.upload_direct(&lying, &data[..], &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::SizeExceeded { .. }));

    let data = pattern(100, 1);
    let mut short = direct("blob", &data);
    short.declared_size = 120;
    let err = h.service.upload_direct(&short, &data[..], &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::FileSizeMismatch { declared: 120, actual: 100 })
    ));

    assert!(files_in(&h.root, "blob").is_empty());
    assert!(files_in(&h.root, "staging").is_empty());
}

#[tokio::test]
async fn test_cancelled_direct_upload_leaves_nothing() {
    let h = harness().await;
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    writer.write_all(&pattern(4096, 2)).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let request = DirectUpload {
        file_name: "stream.bin".to_string(),
        file_type: "blob".to_string(),
        declared_size: 8192,
    };
    let err = h.service.upload_direct(&request, reader, &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Cancelled));
    drop(writer);

    assert!(files_in(&h.root, "staging").is_empty());
    assert!(files_in(&h.root, "blob").is_empty());
    let mut query = ListQuery::new(1, 10);
    query.filter.deleted = DeletedFilter::All;
    assert_eq!(h.service.list_records(&query).await.unwrap().total, 0);
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
async fn test_listing_filters_and_pagination() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let mut ids = Vec::new();
    for seed in 0..5u8 {
        let data = pattern(100, seed);
        let record = h
            .service
            .upload_direct(&direct("image", &data), &data[..], &cancel)
            .await
            .unwrap();
        ids.push(record.id);
    }
    let doc = pattern(100, 77);
    h.service
        .upload_direct(&direct("doc", &doc), &doc[..], &cancel)
        .await
        .unwrap();
    h.service.disable(&ids[0], "spam").await.unwrap();

    let page = h.service.list_records(&ListQuery::new(1, 4)).await.unwrap();
    assert_eq!(page.total, 6);
    assert_eq!(page.records.len(), 4);
    let page = h.service.list_records(&ListQuery::new(2, 4)).await.unwrap();
    assert_eq!(page.records.len(), 2);

    let images = ListQuery::new(1, 10).with_filter(FileFilter {
        path_prefix: Some("image/".to_string()),
        ..Default::default()
    });
    assert_eq!(h.service.list_records(&images).await.unwrap().total, 5);

    let disabled = ListQuery::new(1, 10).with_filter(FileFilter {
        status: Some(FileStatus::Disable),
        ..Default::default()
    });
    let page = h.service.list_records(&disabled).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].id, ids[0]);

    let by_id = ListQuery::new(1, 10).with_filter(FileFilter {
        id: Some(ids[3].clone()),
        ..Default::default()
    });
    assert_eq!(h.service.list_records(&by_id).await.unwrap().total, 1);
}

#[tokio::test]
async fn test_oversized_page_rejected_before_store_access() {
    let h = harness().await;
    // A closed pool would surface as a database error if it were queried
    h.service.context().db().close().await;

    let err = h.service.list_records(&ListQuery::new(1, 200)).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation(ValidationError::PageSize(200))));
}

#[tokio::test]
async fn test_large_records_are_streamed() {
    let h = harness_with(|config| config.ingest.stream_read_threshold = 512).await;
    let cancel = CancellationToken::new();

    let small = pattern(512, 1);
    let large = pattern(513, 2);
    let small = h
        .service
        .upload_direct(&direct("image", &small), &small[..], &cancel)
        .await
        .unwrap();
    let large_record = h
        .service
        .upload_direct(&direct("image", &large), &large[..], &cancel)
        .await
        .unwrap();

    assert!(matches!(h.service.resolve_read(&small.id).await.unwrap(), ReadHandle::Path(_)));
    match h.service.resolve_read(&large_record.id).await.unwrap() {
        ReadHandle::Stream { size, .. } => assert_eq!(size, 513),
        other => panic!("expected a stream, got {:?}", other),
    }
    assert_eq!(read_record(&h.service, &large_record.id).await, large);
}

#[tokio::test]
async fn test_lifecycle_on_missing_record() {
    let h = harness().await;
    assert!(matches!(h.service.get_record("nope").await, Err(IngestError::NotFound(_))));
    assert!(matches!(h.service.disable("nope", "x").await, Err(IngestError::NotFound(_))));
    assert!(matches!(h.service.soft_delete("nope").await, Err(IngestError::NotFound(_))));
}

// ============================================================================
// Session Retention
// ============================================================================

#[tokio::test]
async fn test_cancel_session_purges_scratch() {
    let h = harness().await;
    let parts = [pattern(100, 1), pattern(100, 2)];
    let whole = parts.concat();
    let upload_id = register_all(&h.service, "doc", &whole, 2, &[(1, &parts[0][..])]).await;
    assert!(h.root.join("chunks").join(&upload_id).exists());

    h.service.cancel_session(&upload_id).await.unwrap();
    assert!(!h.root.join("chunks").join(&upload_id).exists());
    // Cancelling twice is harmless
    h.service.cancel_session(&upload_id).await.unwrap();

    let status = h.service.session_status(&upload_id).await.unwrap();
    assert_eq!(status.state, SessionState::Abandoned);

    let err = h
        .service
        .complete_upload(&upload_id, 2, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Conflict(ConflictKind::SessionClosed(_))));
}

#[tokio::test]
async fn test_janitor_reclaims_idle_sessions() {
    let h = harness().await;
    let parts = [pattern(100, 1), pattern(100, 2)];
    let whole = parts.concat();
    let idle = register_all(&h.service, "doc", &whole, 2, &[(1, &parts[0][..])]).await;
    let fresh = register_all(&h.service, "doc", &whole, 2, &[(2, &parts[1][..])]).await;

    sqlx::query("UPDATE chunk_sessions SET updated_at = ? WHERE upload_id = ?")
        .bind(chrono::Utc::now() - chrono::Duration::hours(48))
        .bind(&idle)
        .execute(h.service.context().db())
        .await
        .unwrap();

    let stats = h.service.sweep().await.unwrap();
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.purged, 1);

    assert!(!h.root.join("chunks").join(&idle).exists());
    assert!(h.root.join("chunks").join(&fresh).exists());
    assert_eq!(
        h.service.session_status(&idle).await.unwrap().state,
        SessionState::Abandoned
    );
    assert_eq!(
        h.service.session_status(&fresh).await.unwrap().state,
        SessionState::Open
    );

    // A second pass has nothing left to do
    let stats = h.service.sweep().await.unwrap();
    assert_eq!(stats.abandoned + stats.purged, 0);
}

#[tokio::test]
async fn test_janitor_task_stops_on_shutdown() {
    let h = harness().await;
    let shutdown = CancellationToken::new();
    let handle = h.service.start_janitor(shutdown.clone());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
